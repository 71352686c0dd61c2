//! Safelease scripting command line surface.
//!
//! Stdout carries only machine-consumable results; failures are reported
//! through the exit status (and logged to stderr).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use log::{self, LevelFilter};
use safelease::{
    load_ref_tag, logger_init, pf_error, pf_warn, query_tag, store_ref_tag,
    ErrorKind, LeaseParams, SafeleaseError, SectorDevice, SectorLease, Tag,
    ME,
};
use tokio::runtime::Builder;

/// Lease and op timeout used by `release`, which takes no timing arguments.
const RELEASE_OP_MAX_MS: u64 = 10000;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Open the device with O_DSYNC instead of O_DIRECT (for image files on
    /// filesystems without direct I/O support).
    #[arg(long, global = true)]
    no_direct: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take the lease; prints the winning timestamp.
    Acquire {
        /// File recording the last observed tag across invocations.
        #[arg(short = 'r', long)]
        ref_path: Option<PathBuf>,

        /// Keep backing off while the holder keeps renewing.
        #[arg(short, long)]
        busy_loop: bool,

        /// Byte offset of the lease sector.
        #[arg(short, long, default_value_t = 0)]
        offset: u64,

        path: PathBuf,
        id: String,
        lease_ms: u64,
        op_max_ms: u64,
    },

    /// Renew a held lease; prints the new timestamp, or 0 if the holder
    /// must stop renewing.
    Renew {
        /// File recording the last written tag.
        #[arg(short = 'r', long)]
        ref_path: Option<PathBuf>,

        /// Byte offset of the lease sector.
        #[arg(short, long, default_value_t = 0)]
        offset: u64,

        /// Timestamp (hex) of the tag this holder wrote last.
        #[arg(short = 't', long)]
        last_ts: Option<String>,

        path: PathBuf,
        id: String,
        lease_ms: u64,
        op_max_ms: u64,
    },

    /// Free the lease if held by `id` (or unconditionally with `-f`).
    Release {
        /// Free the lease whoever holds it.
        #[arg(short, long)]
        force: bool,

        /// Byte offset of the lease sector.
        #[arg(short, long, default_value_t = 0)]
        offset: u64,

        path: PathBuf,
        id: String,
    },

    /// Print the current holder.
    Query {
        /// Byte offset of the lease sector.
        #[arg(short, long, default_value_t = 0)]
        offset: u64,

        path: PathBuf,
    },
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(SafeleaseError)` on any error.
    fn sanitize(&self) -> Result<(), SafeleaseError> {
        match &self.command {
            Command::Acquire {
                offset,
                id,
                lease_ms,
                op_max_ms,
                ..
            } => {
                SectorDevice::check_offset(*offset)?;
                Tag::validate_owner_id(id)?;
                LeaseParams::new_strict(*lease_ms, *op_max_ms)?;
            }
            Command::Renew {
                offset,
                last_ts,
                id,
                lease_ms,
                op_max_ms,
                ..
            } => {
                SectorDevice::check_offset(*offset)?;
                Tag::validate_owner_id(id)?;
                LeaseParams::new_strict(*lease_ms, *op_max_ms)?;
                if let Some(last_ts) = last_ts {
                    parse_timestamp(last_ts)?;
                }
            }
            Command::Release { offset, id, .. } => {
                SectorDevice::check_offset(*offset)?;
                Tag::validate_owner_id(id)?;
            }
            Command::Query { offset, .. } => {
                SectorDevice::check_offset(*offset)?;
            }
        }
        Ok(())
    }
}

/// Parses a hex timestamp as printed by `acquire`/`renew`.
fn parse_timestamp(s: &str) -> Result<u64, SafeleaseError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| {
        SafeleaseError::new(
            ErrorKind::InvalidParameters,
            format!("invalid timestamp '{}': {}", s, e),
        )
    })
}

/// Renders a tag the way `query` prints it.
fn describe_tag(tag: &Tag) -> Result<String, SafeleaseError> {
    if tag.is_free() {
        return Ok("FREE".into());
    }
    let fields = tag.decode()?;
    let date = i64::try_from(fields.timestamp)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_else(|| "invalid date".into());
    Ok(format!(
        "LOCKED: ID {} TS {:016x} ({})",
        fields.owner_id, fields.timestamp, date
    ))
}

fn open_lease(
    path: &Path,
    direct: bool,
    offset: u64,
    id: &str,
    params: LeaseParams,
) -> Result<SectorLease, SafeleaseError> {
    let device = Arc::new(SectorDevice::open(path, direct)?);
    SectorLease::new(device, offset, id, params)
}

/// Runs the requested subcommand, returning what to print on stdout.
async fn run_command(
    command: Command,
    direct: bool,
) -> Result<String, SafeleaseError> {
    match command {
        Command::Acquire {
            ref_path,
            busy_loop,
            offset,
            path,
            id,
            lease_ms,
            op_max_ms,
        } => {
            let params = LeaseParams::new_strict(lease_ms, op_max_ms)?;
            let lease = open_lease(&path, direct, offset, &id, params)?;

            let mut last_seen = ref_path.as_deref().and_then(load_ref_tag);
            let result = lease.acquire(busy_loop, &mut last_seen).await;
            if let (Some(ref_path), Some(tag)) = (&ref_path, &last_seen) {
                if let Err(e) = store_ref_tag(ref_path, tag) {
                    pf_warn!("error storing reference tag: {}", e);
                }
            }
            Ok(format!("{:016x}", result?))
        }

        Command::Renew {
            ref_path,
            offset,
            last_ts,
            path,
            id,
            lease_ms,
            op_max_ms,
        } => {
            let params = LeaseParams::new_strict(lease_ms, op_max_ms)?;
            let known_ts = last_ts.as_deref().map(parse_timestamp).transpose()?;
            let lease = open_lease(&path, direct, offset, &id, params)?;

            let ts = lease.renew(known_ts).await?;
            if let Some(ref_path) = &ref_path {
                store_ref_tag(ref_path, &Tag::encode(&id, ts)?)?;
            }
            Ok(format!("{:016x}", ts))
        }

        Command::Release {
            force,
            offset,
            path,
            id,
        } => {
            let params =
                LeaseParams::new(RELEASE_OP_MAX_MS, RELEASE_OP_MAX_MS)?;
            let lease = open_lease(&path, direct, offset, &id, params)?;
            if !lease.release(force).await? {
                pf_warn!("lease not held by '{}', nothing released", id);
            }
            Ok(String::new())
        }

        Command::Query { offset, path } => {
            let device = Arc::new(SectorDevice::open(&path, direct)?);
            let tag = query_tag(device, offset, None).await?;
            describe_tag(&tag)
        }
    }
}

/// What a failed command still prints on stdout, if anything. A renewal that
/// can never succeed again prints `0` so the holder stops renewing.
fn failure_output(renewing: bool, e: &SafeleaseError) -> Option<&'static str> {
    if renewing
        && matches!(e.kind(), ErrorKind::LeaseLost | ErrorKind::TimedOut)
    {
        Some("0")
    } else {
        None
    }
}

/// Actual main function of the safelease CLI.
fn cli_main() -> Result<(), SafeleaseError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let me = match &args.command {
        Command::Acquire { id, .. }
        | Command::Renew { id, .. }
        | Command::Release { id, .. } => id.clone(),
        Command::Query { .. } => "query".into(),
    };
    let _ = ME.set(me);

    // single-shot command: a small runtime is plenty
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-cli")
        .build()?;

    let renewing = matches!(args.command, Command::Renew { .. });
    let output =
        match runtime.block_on(run_command(args.command, !args.no_direct)) {
            Ok(output) => output,
            Err(e) => {
                if let Some(output) = failure_output(renewing, &e) {
                    println!("{}", output);
                }
                return Err(e);
            }
        };
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(())
}

/// Main function of the safelease CLI.
fn main() -> ExitCode {
    logger_init();
    if std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(LevelFilter::Warn);
    }

    if let Err(ref e) = cli_main() {
        pf_error!("{}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliArgs, SafeleaseError> {
        CliArgs::try_parse_from(
            std::iter::once("safelease").chain(args.iter().copied()),
        )
        .map_err(|e| SafeleaseError::msg(e.to_string()))
    }

    #[test]
    fn sanitize_valid() -> Result<(), SafeleaseError> {
        let args = parse(&[
            "acquire", "-r", "/tmp/ref", "-b", "-o", "1024", "/dev/sdb",
            "host1", "10000", "1000",
        ])?;
        args.sanitize()?;
        match args.command {
            Command::Acquire {
                ref_path,
                busy_loop,
                offset,
                ..
            } => {
                assert_eq!(ref_path, Some(PathBuf::from("/tmp/ref")));
                assert!(busy_loop);
                assert_eq!(offset, 1024);
            }
            _ => panic!("wrong subcommand"),
        }

        parse(&[
            "renew",
            "-t",
            "0000000000003039",
            "/dev/sdb",
            "host1",
            "10000",
            "1000",
        ])?
        .sanitize()?;
        parse(&["release", "-f", "/dev/sdb", "host1"])?.sanitize()?;
        parse(&["--no-direct", "query", "-o", "512", "/tmp/img"])?.sanitize()?;
        Ok(())
    }

    #[test]
    fn sanitize_invalid_id() -> Result<(), SafeleaseError> {
        for id in ["", "a-very-long-owner-id", "------FREE------"] {
            // `--` keeps the sentinel id from parsing as a flag
            let args =
                parse(&["acquire", "--", "/dev/sdb", id, "10000", "1000"])?;
            assert!(args.sanitize().is_err(), "id {:?}", id);
        }
        assert!(parse(&["release", "/dev/sdb", ""])?.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_timing() -> Result<(), SafeleaseError> {
        for (lease_ms, op_max_ms) in [
            ("0", "1000"),
            ("10000", "0"),
            ("10000", "1500"),
            ("1000", "2000"),
            ("10000", "500"),
            ("86400001", "1000"),
            ("18446744073709551615", "1000"),
        ] {
            let args = parse(&[
                "renew", "/dev/sdb", "host1", lease_ms, op_max_ms,
            ])?;
            assert!(args.sanitize().is_err());
        }
        Ok(())
    }

    #[test]
    fn sanitize_invalid_offset() -> Result<(), SafeleaseError> {
        let args = parse(&["query", "-o", "100", "/dev/sdb"])?;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_last_ts() -> Result<(), SafeleaseError> {
        let args = parse(&[
            "renew", "-t", "xyz", "/dev/sdb", "host1", "10000", "1000",
        ])?;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn missing_positional() {
        assert!(parse(&["acquire", "/dev/sdb", "host1", "10000"]).is_err());
    }

    #[test]
    fn query_output() -> Result<(), SafeleaseError> {
        assert_eq!(describe_tag(&Tag::free())?, "FREE");
        let tag = Tag::encode("host1", 1_700_000_000_000_000)?;
        assert_eq!(
            describe_tag(&tag)?,
            "LOCKED: ID host1 TS 00060a24181e4000 \
             (2023-11-14T22:13:20.000000Z)"
        );
        assert_eq!(parse_timestamp("00060a24181e4000")?, 1_700_000_000_000_000);
        Ok(())
    }

    /// Creates (or resets) a zero-filled scratch image of four sectors.
    fn prepare_image(path: &str) -> Result<PathBuf, SafeleaseError> {
        let file = std::fs::File::create(path)?;
        file.set_len(4 * 512)?;
        Ok(PathBuf::from(path))
    }

    fn acquire_cmd(
        path: &Path,
        id: &str,
        ref_path: Option<&str>,
    ) -> Command {
        Command::Acquire {
            ref_path: ref_path.map(PathBuf::from),
            busy_loop: false,
            offset: 0,
            path: path.to_path_buf(),
            id: id.into(),
            lease_ms: 10000,
            op_max_ms: 1000,
        }
    }

    fn renew_cmd(path: &Path, id: &str, last_ts: &str) -> Command {
        Command::Renew {
            ref_path: None,
            offset: 0,
            last_ts: Some(last_ts.into()),
            path: path.to_path_buf(),
            id: id.into(),
            lease_ms: 10000,
            op_max_ms: 1000,
        }
    }

    fn query_cmd(path: &Path) -> Command {
        Command::Query {
            offset: 0,
            path: path.to_path_buf(),
        }
    }

    fn release_cmd(path: &Path, id: &str, force: bool) -> Command {
        Command::Release {
            force,
            offset: 0,
            path: path.to_path_buf(),
            id: id.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_then_query() -> Result<(), SafeleaseError> {
        let path = prepare_image("/tmp/test-safelease-cli-0.img")?;
        run_command(release_cmd(&path, "host1", true), false).await?;
        assert_eq!(run_command(query_cmd(&path), false).await?, "FREE");

        let ts = run_command(acquire_cmd(&path, "host1", None), false).await?;
        assert_eq!(ts.len(), 16);
        assert!(ts.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
        let held = run_command(query_cmd(&path), false).await?;
        assert!(
            held.starts_with(&format!("LOCKED: ID host1 TS {} (", ts)),
            "query printed {:?}",
            held
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn renew_and_release() -> Result<(), SafeleaseError> {
        let path = prepare_image("/tmp/test-safelease-cli-1.img")?;
        let ts = run_command(acquire_cmd(&path, "host1", None), false).await?;

        let renewed = run_command(renew_cmd(&path, "host1", &ts), false).await?;
        assert_eq!(renewed.len(), 16);
        assert_ne!(renewed, ts);
        assert!(parse_timestamp(&renewed)? > parse_timestamp(&ts)?);

        // a stale timestamp means the lease was rewritten behind our back
        let e = run_command(renew_cmd(&path, "host1", &ts), false)
            .await
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::LeaseLost);
        assert_eq!(failure_output(true, &e), Some("0"));
        assert_eq!(failure_output(false, &e), None);

        // someone else's lease is not ours to renew, nor to release
        let e = run_command(renew_cmd(&path, "host2", &renewed), false)
            .await
            .unwrap_err();
        assert_eq!(failure_output(true, &e), Some("0"));
        run_command(release_cmd(&path, "host2", false), false).await?;
        assert!(run_command(query_cmd(&path), false)
            .await?
            .starts_with("LOCKED: ID host1 "));

        assert_eq!(
            run_command(release_cmd(&path, "host1", false), false).await?,
            ""
        );
        assert_eq!(run_command(query_cmd(&path), false).await?, "FREE");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn contended_acquire_takes_over() -> Result<(), SafeleaseError> {
        let path = prepare_image("/tmp/test-safelease-cli-2.img")?;
        let ref_path = "/tmp/test-safelease-cli-2.ref";
        let _ = std::fs::remove_file(ref_path);
        let ts = run_command(acquire_cmd(&path, "host1", None), false).await?;

        // first attempt only observes the holder
        let e = run_command(acquire_cmd(&path, "host2", Some(ref_path)), false)
            .await
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Busy);
        assert_eq!(failure_output(false, &e), None);
        let seen = load_ref_tag(Path::new(ref_path));
        assert_eq!(seen, Some(Tag::encode("host1", parse_timestamp(&ts)?)?));

        // host1 never renewed in between, so the retry takes over
        let won =
            run_command(acquire_cmd(&path, "host2", Some(ref_path)), false)
                .await?;
        let held = run_command(query_cmd(&path), false).await?;
        assert!(held.starts_with(&format!("LOCKED: ID host2 TS {} (", won)));
        Ok(())
    }

    #[test]
    fn renew_failure_output() {
        for (kind, output) in [
            (ErrorKind::LeaseLost, Some("0")),
            (ErrorKind::TimedOut, Some("0")),
            (ErrorKind::Io, None),
            (ErrorKind::Corrupted, None),
        ] {
            let e = SafeleaseError::new(kind, "renew failed");
            assert_eq!(failure_output(true, &e), output, "kind {:?}", kind);
        }
    }
}
