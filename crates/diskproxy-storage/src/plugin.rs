use std::ffi::{c_char, c_int, c_void, CString};

use crate::{Backing, ProxyError, Result};

/// Provider callbacks, C ABI. `open` fills in the three I/O entry points and
/// optionally the backing size, returning an opaque session handle.
pub type PluginReadFn =
    unsafe extern "C" fn(handle: *mut c_void, buf: *mut c_void, len: usize, offset: i64) -> isize;
pub type PluginWriteFn =
    unsafe extern "C" fn(handle: *mut c_void, buf: *const c_void, len: usize, offset: i64) -> isize;
pub type PluginCloseFn = unsafe extern "C" fn(handle: *mut c_void) -> c_int;
pub type PluginOpenFn = unsafe extern "C" fn(
    name: *const c_char,
    read_only: c_int,
    out_read: *mut Option<PluginReadFn>,
    out_write: *mut Option<PluginWriteFn>,
    out_close: *mut Option<PluginCloseFn>,
    out_size: *mut i64,
) -> *mut c_void;

/// Backing served by a dynamically loaded provider library.
///
/// The library stays loaded and the session handle stays open for the life of
/// this value; `close` runs on drop.
#[derive(Debug)]
pub struct PluginBacking {
    lib: *mut c_void,
    handle: *mut c_void,
    read_fn: PluginReadFn,
    write_fn: Option<PluginWriteFn>,
    close_fn: PluginCloseFn,
    size: u64,
}

// The provider contract is a single-session, externally synchronized API; the
// proxy itself is single threaded and only ever moves the backing between
// startup and the session loop.
unsafe impl Send for PluginBacking {}

impl PluginBacking {
    /// Load `library`, resolve `entry` and open `device` through it.
    pub fn open(library: &str, entry: &str, device: &str, read_only: bool) -> Result<Self> {
        let lib_c = CString::new(library)
            .map_err(|_| ProxyError::Plugin(format!("bad library path: {library}")))?;
        let entry_c = CString::new(entry)
            .map_err(|_| ProxyError::Plugin(format!("bad entry name: {entry}")))?;
        let device_c = CString::new(device)
            .map_err(|_| ProxyError::Plugin(format!("bad device name: {device}")))?;

        let lib = unsafe { libc::dlopen(lib_c.as_ptr(), libc::RTLD_NOW) };
        if lib.is_null() {
            return Err(ProxyError::Plugin(format!(
                "dlopen {library}: {}",
                dl_error()
            )));
        }

        let open_sym = unsafe { libc::dlsym(lib, entry_c.as_ptr()) };
        if open_sym.is_null() {
            let err = dl_error();
            unsafe { libc::dlclose(lib) };
            return Err(ProxyError::Plugin(format!(
                "cannot find {entry} in {library}: {err}"
            )));
        }
        let open_fn: PluginOpenFn = unsafe { std::mem::transmute(open_sym) };

        let mut read_fn: Option<PluginReadFn> = None;
        let mut write_fn: Option<PluginWriteFn> = None;
        let mut close_fn: Option<PluginCloseFn> = None;
        let mut size: i64 = 0;

        let handle = unsafe {
            open_fn(
                device_c.as_ptr(),
                read_only as c_int,
                &mut read_fn,
                &mut write_fn,
                &mut close_fn,
                &mut size,
            )
        };

        // Providers signal failure with a null or all-ones handle.
        if handle.is_null() || handle as usize == usize::MAX {
            unsafe { libc::dlclose(lib) };
            return Err(ProxyError::Plugin(format!(
                "provider failed to open '{device}'"
            )));
        }

        let (Some(read_fn), Some(close_fn)) = (read_fn, close_fn) else {
            unsafe { libc::dlclose(lib) };
            return Err(ProxyError::Plugin(
                "provider did not supply read/close callbacks".into(),
            ));
        };
        if !read_only && write_fn.is_none() {
            unsafe { libc::dlclose(lib) };
            return Err(ProxyError::Plugin(
                "provider did not supply a write callback for a read-write open".into(),
            ));
        }

        Ok(Self {
            lib,
            handle,
            read_fn,
            write_fn,
            close_fn,
            size: size.max(0) as u64,
        })
    }

    /// Size reported by the provider's open call; 0 if it did not know.
    pub fn reported_size(&self) -> u64 {
        self.size
    }
}

impl Backing for PluginBacking {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let offset: i64 = offset.try_into().map_err(|_| ProxyError::OffsetOverflow)?;
        let got =
            unsafe { (self.read_fn)(self.handle, buf.as_mut_ptr().cast(), buf.len(), offset) };
        if got < 0 {
            return Err(ProxyError::last_os("provider read"));
        }
        Ok(got as usize)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let Some(write_fn) = self.write_fn else {
            return Err(ProxyError::PolicyViolation("provider opened read-only"));
        };
        let offset: i64 = offset.try_into().map_err(|_| ProxyError::OffsetOverflow)?;
        let got = unsafe { write_fn(self.handle, buf.as_ptr().cast(), buf.len(), offset) };
        if got < 0 {
            return Err(ProxyError::last_os("provider write"));
        }
        Ok(got as usize)
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.size)
    }
}

impl Drop for PluginBacking {
    fn drop(&mut self) {
        unsafe {
            (self.close_fn)(self.handle);
            libc::dlclose(self.lib);
        }
    }
}

fn dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        return "unknown dl error".into();
    }
    unsafe { std::ffi::CStr::from_ptr(err) }
        .to_string_lossy()
        .into_owned()
}

/// Split a `--dll=library;entry` argument into its two parts.
pub fn split_plugin_spec(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once(';') {
        Some((lib, entry)) if !lib.is_empty() && !entry.is_empty() => Ok((lib, entry)),
        _ => Err(ProxyError::Plugin(format!(
            "expected library;entry, got '{spec}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_spec_splits() {
        assert_eq!(
            split_plugin_spec("libfoo.so;open_device").unwrap(),
            ("libfoo.so", "open_device")
        );
        assert!(split_plugin_spec("libfoo.so").is_err());
        assert!(split_plugin_spec(";open_device").is_err());
    }

    #[test]
    fn open_missing_library_fails() {
        let err =
            PluginBacking::open("/nonexistent/libnope.so", "open_device", "dev", true).unwrap_err();
        assert!(matches!(err, ProxyError::Plugin(_)));
    }
}
