//! Shared-memory transport round trips, with the test playing the client:
//! it opens the named mapping and semaphores the server created and speaks
//! the cursor-framed protocol through them.

#![cfg(unix)]

use std::ffi::CString;

use diskproxy_server::proto::{
    InfoResponse, IoRequest, IoResponse, REQ_TAG_INFO, REQ_TAG_READ, REQ_TAG_WRITE,
    SHM_HEADER_SIZE,
};
use diskproxy_server::session::{self, ServeGeometry};
use diskproxy_server::transport::ShmTransport;
use diskproxy_storage::{ImageIo, MemBacking};

struct ShmClient {
    map: *mut u8,
    map_len: usize,
    request_sem: *mut libc::sem_t,
    response_sem: *mut libc::sem_t,
}

impl ShmClient {
    fn open(device: &str, buffer_size: usize) -> Self {
        let map_len = SHM_HEADER_SIZE + buffer_size;
        let shm_name = CString::new(format!("/{device}")).unwrap();
        let fd = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0) };
        assert!(fd >= 0, "shm_open failed");

        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        assert_ne!(map, libc::MAP_FAILED, "mmap failed");

        let open_sem = |suffix: &str| {
            let name = CString::new(format!("/{device}{suffix}")).unwrap();
            let sem = unsafe { libc::sem_open(name.as_ptr(), 0) };
            assert_ne!(sem, libc::SEM_FAILED, "sem_open failed");
            sem
        };

        Self {
            map: map.cast(),
            map_len,
            request_sem: open_sem("_Request"),
            response_sem: open_sem("_Response"),
        }
    }

    fn header(&mut self, len: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.map, len) }
    }

    fn payload(&mut self, len: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.map.add(SHM_HEADER_SIZE), len) }
    }

    /// Post the request baton and wait for the server's response.
    fn exchange(&mut self) {
        unsafe {
            assert_eq!(libc::sem_post(self.request_sem), 0);
            while libc::sem_wait(self.response_sem) != 0 {}
        }
    }

    /// Hand the baton over without waiting (used to end the session).
    fn post_only(&mut self) {
        unsafe {
            assert_eq!(libc::sem_post(self.request_sem), 0);
        }
    }

    fn info(&mut self) -> InfoResponse {
        self.header(8).copy_from_slice(&REQ_TAG_INFO.to_le_bytes());
        self.exchange();
        let mut raw = [0u8; 24];
        raw.copy_from_slice(self.header(24));
        InfoResponse::decode(&raw)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> IoResponse {
        self.header(8).copy_from_slice(&REQ_TAG_WRITE.to_le_bytes());
        let req = IoRequest {
            offset,
            length: data.len() as u64,
        };
        self.header(24)[8..24].copy_from_slice(&req.encode());
        self.payload(data.len()).copy_from_slice(data);
        self.exchange();
        let mut raw = [0u8; 16];
        raw.copy_from_slice(self.header(16));
        IoResponse::decode(&raw)
    }

    fn read(&mut self, offset: u64, length: u64) -> (IoResponse, Vec<u8>) {
        self.header(8).copy_from_slice(&REQ_TAG_READ.to_le_bytes());
        let req = IoRequest { offset, length };
        self.header(24)[8..24].copy_from_slice(&req.encode());
        self.exchange();
        let mut raw = [0u8; 16];
        raw.copy_from_slice(self.header(16));
        let resp = IoResponse::decode(&raw);
        let mut data = Vec::new();
        if resp.errorno == 0 {
            data = self.payload(resp.length as usize).to_vec();
        }
        (resp, data)
    }
}

impl Drop for ShmClient {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map.cast(), self.map_len);
            libc::sem_close(self.request_sem);
            libc::sem_close(self.response_sem);
        }
    }
}

#[test]
fn shared_memory_round_trips() {
    let device = format!("diskproxy-shm-test-{}", std::process::id());
    let buffer_size = 8192;

    let mut transport = ShmTransport::create(&device, buffer_size).unwrap();

    // The second instance must be refused while the first is alive.
    assert!(ShmTransport::create(&device, buffer_size).is_err());

    let mut client = ShmClient::open(&device, buffer_size);

    let server_device = device.clone();
    let server = std::thread::spawn(move || {
        let mut image = ImageIo::Raw(MemBacking::with_len(1 << 20));
        let geometry = ServeGeometry {
            image_offset: 0,
            file_size: 1 << 20,
            req_alignment: 1,
            read_only: false,
        };
        transport.wait_for_client(&server_device).unwrap();
        session::run(&mut image, &mut transport, geometry)
    });

    let info = client.info();
    assert_eq!(info.file_size, 1 << 20);
    assert_eq!(info.flags, 0);

    let payload = [0x7Cu8; 1024];
    let resp = client.write(2048, &payload);
    assert_eq!(resp.errorno, 0);
    assert_eq!(resp.length, 1024);

    let (resp, data) = client.read(2048, 1024);
    assert_eq!(resp.errorno, 0);
    assert_eq!(resp.length, 1024);
    assert_eq!(data, payload);

    // A write that claims more than the payload slot fails the session; that
    // is the only way a shared-memory client can end it.
    client
        .header(8)
        .copy_from_slice(&REQ_TAG_WRITE.to_le_bytes());
    let req = IoRequest {
        offset: 0,
        length: (buffer_size + 1) as u64,
    };
    client.header(24)[8..24].copy_from_slice(&req.encode());
    client.post_only();

    assert!(server.join().unwrap().is_err());
}
