use std::path::PathBuf;

use clap::Parser;

/// Default payload buffer: pointer width in bits, as MiB (64 MiB on 64-bit).
pub const DEFAULT_BUFFER_SIZE: usize = (std::mem::size_of::<usize>() << 3) << 20;

pub const DEFAULT_ALIGNMENT: u64 = 1;

/// Exit codes. Usage errors and fatal faults share the catch-all -1.
pub const EXIT_OK: i32 = 0;
pub const EXIT_IMAGE: i32 = 1;
pub const EXIT_TRANSPORT: i32 = 2;
pub const EXIT_VOLUME_PREP: i32 = 9;
pub const EXIT_USAGE: i32 = -1;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "diskproxy",
    version,
    about = "Serves a disk image to one client as a block device, over TCP, \
             stdio, a local device, shared memory or the client kernel driver.",
    long_about = None
)]
pub struct Cli {
    /// Serve through a provider library instead of opening the image
    /// directly. LIBRARY is dlopen'ed and ENTRY is its open function.
    #[arg(long = "dll", value_name = "LIBRARY;ENTRY")]
    pub plugin: Option<String>,

    /// Treat a bare comm name as a kernel-driver rendezvous object
    /// (equivalent to the `drv:` prefix).
    #[arg(long = "drv")]
    pub force_driver: bool,

    /// Skip dynamic-VHD autodetection and serve the raw bytes.
    #[arg(long = "novhd")]
    pub no_vhd: bool,

    /// Open the image read-only; client writes get EBADF.
    #[arg(short = 'r')]
    pub read_only: bool,

    /// TCP port to listen on, `-` for stdio, `shm:NAME`, `drv:NAME`, or a
    /// local device path.
    pub comm: String,

    /// Image file, raw device, or provider-specific device name.
    pub image: String,

    /// Exposed size (`B/K/M/G/T` binary or `b/k/m/g/t` decimal suffix), a
    /// bare sector count, or a partition number when below 512. Defaults to
    /// partition 1, falling back to the whole image when there is no MBR.
    #[arg(value_name = "SIZE|PARTITION")]
    pub size_or_partition: Option<String>,

    /// Up to three further values: image offset (skipped when a partition
    /// supplied one), required alignment in bytes, payload buffer size.
    #[arg(value_name = "OFFSET ALIGN BUFSIZE", num_args = 0..=3)]
    pub tuning: Vec<String>,
}

/// Where the client talks to us.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CommEndpoint {
    Tcp(u16),
    Stdio,
    Shm(String),
    Drv(String),
    Device(PathBuf),
}

pub fn classify_comm(comm: &str, force_driver: bool) -> CommEndpoint {
    if let Some(name) = strip_prefix_ignore_case(comm, "shm:") {
        return CommEndpoint::Shm(name.to_string());
    }
    if let Some(name) = strip_prefix_ignore_case(comm, "drv:") {
        return CommEndpoint::Drv(name.to_string());
    }
    if comm == "-" {
        return CommEndpoint::Stdio;
    }
    if let Ok(port) = comm.parse::<u16>() {
        if port != 0 {
            return CommEndpoint::Tcp(port);
        }
    }
    if force_driver {
        return CommEndpoint::Drv(comm.to_string());
    }
    CommEndpoint::Device(PathBuf::from(comm))
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// A size-style argument: scaled to bytes by a suffix, or a bare number
/// whose meaning (sectors, partition index, bytes) depends on the position.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SizeArg {
    Bytes(u64),
    Bare(u64),
}

/// Parse `123`, `64K`, `2M`, `1g`... Uppercase suffixes are binary
/// (K = 1024), lowercase decimal (k = 1000); `B`/`b` mean plain bytes.
pub fn parse_scaled(raw: &str) -> Result<SizeArg, String> {
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size value: '{raw}'"))?;

    let scaled = |shift: u32| -> Result<SizeArg, String> {
        value
            .checked_shl(shift)
            .filter(|v| v >> shift == value)
            .map(SizeArg::Bytes)
            .ok_or_else(|| format!("size value out of range: '{raw}'"))
    };
    let decimal = |factor: u64| -> Result<SizeArg, String> {
        value
            .checked_mul(factor)
            .map(SizeArg::Bytes)
            .ok_or_else(|| format!("size value out of range: '{raw}'"))
    };

    match suffix {
        "" => Ok(SizeArg::Bare(value)),
        "B" | "b" => Ok(SizeArg::Bytes(value)),
        "K" => scaled(10),
        "M" => scaled(20),
        "G" => scaled(30),
        "T" => scaled(40),
        "k" => decimal(1_000),
        "m" => decimal(1_000_000),
        "g" => decimal(1_000_000_000),
        "t" => decimal(1_000_000_000_000),
        other => Err(format!("unsupported size suffix: '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_and_decimal_suffixes() {
        assert_eq!(parse_scaled("512").unwrap(), SizeArg::Bare(512));
        assert_eq!(parse_scaled("512B").unwrap(), SizeArg::Bytes(512));
        assert_eq!(parse_scaled("2K").unwrap(), SizeArg::Bytes(2048));
        assert_eq!(parse_scaled("2k").unwrap(), SizeArg::Bytes(2000));
        assert_eq!(parse_scaled("3M").unwrap(), SizeArg::Bytes(3 << 20));
        assert_eq!(parse_scaled("1G").unwrap(), SizeArg::Bytes(1 << 30));
        assert_eq!(parse_scaled("1T").unwrap(), SizeArg::Bytes(1 << 40));
        assert_eq!(parse_scaled("1t").unwrap(), SizeArg::Bytes(1_000_000_000_000));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_scaled("").is_err());
        assert!(parse_scaled("12Q").is_err());
        assert!(parse_scaled("K").is_err());
        assert!(parse_scaled("12KB").is_err());
        assert!(parse_scaled("99999999999999999999999").is_err());
    }

    #[test]
    fn overflow_is_rejected() {
        assert!(parse_scaled(&format!("{}K", u64::MAX / 512)).is_err());
        assert!(parse_scaled(&format!("{}t", u64::MAX / 2)).is_err());
    }

    #[test]
    fn comm_classification() {
        assert_eq!(classify_comm("9000", false), CommEndpoint::Tcp(9000));
        assert_eq!(classify_comm("-", false), CommEndpoint::Stdio);
        assert_eq!(
            classify_comm("shm:disk0", false),
            CommEndpoint::Shm("disk0".into())
        );
        assert_eq!(
            classify_comm("SHM:disk0", false),
            CommEndpoint::Shm("disk0".into())
        );
        assert_eq!(
            classify_comm("drv:disk0", false),
            CommEndpoint::Drv("disk0".into())
        );
        assert_eq!(
            classify_comm("/dev/ttyS0", false),
            CommEndpoint::Device(PathBuf::from("/dev/ttyS0"))
        );
        // Port 0 is not a listenable port; it names a file.
        assert_eq!(
            classify_comm("0", false),
            CommEndpoint::Device(PathBuf::from("0"))
        );
        assert_eq!(
            classify_comm("disk0", true),
            CommEndpoint::Drv("disk0".into())
        );
    }

    #[test]
    fn cli_parses_the_documented_surface() {
        let cli = Cli::try_parse_from([
            "diskproxy", "--novhd", "-r", "9000", "/img/disk.vhd", "2", "4096", "1M",
        ])
        .unwrap();
        assert!(cli.no_vhd);
        assert!(cli.read_only);
        assert_eq!(cli.comm, "9000");
        assert_eq!(cli.image, "/img/disk.vhd");
        assert_eq!(cli.size_or_partition.as_deref(), Some("2"));
        assert_eq!(cli.tuning, vec!["4096".to_string(), "1M".to_string()]);
    }

    #[test]
    fn cli_requires_comm_and_image() {
        assert!(Cli::try_parse_from(["diskproxy", "9000"]).is_err());
    }
}
