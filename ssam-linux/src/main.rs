// ssam: Surface System Aggregator Module debug tool (capture decoding, requests, bulk dumps).

mod config;
mod device;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::builder::PossibleValuesParser;
use clap::{ArgAction, Parser, Subcommand};

use ssam_core::commands::{self, legacy_keyboard, EventSpec, FirmwareVersion, HidDescriptor};
use ssam_core::frame::{Decoder, DecoderOptions};
use ssam_core::transfer::{read_all, TraceBuffer};
use ssam_core::{Controller, Record, Request, RequestFlags};

use crate::config::Config;
use crate::device::Device;

/// Surface System Aggregator Module debug tool
#[derive(Parser, Debug)]
#[command(name = "ssam", version, long_about = None)]
struct Cli {
    /// Aggregator debug device (overrides config and SSAM_DEVICE)
    #[arg(long, global = true)]
    device: Option<PathBuf>,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode an IRP monitor capture into JSON protocol records
    Decode {
        /// Capture log exported by the IRP monitor
        capture: PathBuf,
        /// Write JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Pretty-print JSON
        #[arg(long)]
        pretty: bool,
        /// Verify frame checksums instead of skipping them
        #[arg(long)]
        verify_checksums: bool,
    },

    /// Basic command with optional payload
    Request {
        /// Target category
        #[arg(value_parser = parse_int::<u8>)]
        tc: u8,
        /// Target ID
        #[arg(value_parser = parse_int::<u8>)]
        tid: u8,
        /// Command ID
        #[arg(value_parser = parse_int::<u8>)]
        cid: u8,
        /// Instance ID
        #[arg(value_parser = parse_int::<u8>)]
        iid: u8,
        /// Request flags (0x01 has response, 0x02 unsequenced)
        #[arg(value_parser = parse_int::<u16>)]
        flags: u16,
        /// Payload bytes
        #[arg(value_parser = parse_int::<u8>)]
        payload: Vec<u8>,
    },

    /// Detachment system command
    Dtx {
        #[arg(value_parser = PossibleValuesParser::new(commands::names(commands::DTX_COMMANDS)))]
        name: String,
    },

    /// Enable or disable an event source via the SAM, KIP or REG subsystem
    Event {
        #[arg(value_parser = PossibleValuesParser::new(commands::names(commands::EVENT_COMMANDS)))]
        name: String,
        /// Event target category
        #[arg(value_parser = parse_int::<u8>)]
        ev_tc: u8,
        /// Event-is-sequenced flag
        #[arg(value_parser = parse_int::<u8>)]
        ev_seq: u8,
        /// Event instance ID
        #[arg(value_parser = parse_int::<u8>)]
        ev_iid: u8,
    },

    /// HID device queries
    Hid {
        #[command(subcommand)]
        command: HidCommand,
    },

    /// Dump a trace buffer to a file
    TclDump {
        #[arg(value_parser = parse_int::<u8>)]
        iid: u8,
        #[arg(value_parser = parse_int::<u16>)]
        buf_id: u16,
        /// Output file (default tclbuf_iid<iid>_bufid<buf_id>.bin)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the controller firmware version
    Version,
}

#[derive(Subcommand, Debug)]
enum HidCommand {
    /// Legacy keyboard descriptor (0 HID descriptor, 1 report descriptor, 2 device attributes)
    LegacyGetDescriptor {
        #[arg(value_parser = parse_int::<u8>)]
        entry: u8,
    },
    /// Legacy keyboard HID feature report
    LegacyGetFeatureReport {
        #[arg(value_parser = parse_int::<u8>)]
        num: u8,
    },
    /// Legacy keyboard caps lock LED
    LegacySetCapslockLed {
        #[arg(value_parser = parse_int::<u8>)]
        state: u8,
    },
    /// HID descriptor of device instance <iid> (0 HID descriptor, 1 report descriptor, 2 device attributes)
    GetDescriptor {
        #[arg(value_parser = parse_int::<u8>)]
        iid: u8,
        #[arg(value_parser = parse_int::<u8>)]
        entry: u8,
    },
}

/// Integer with optional 0x / 0o / 0b prefix.
fn parse_int<T: TryFrom<u64>>(s: &str) -> Result<T, String> {
    let t = s.trim();
    let (digits, radix) = match t.get(..2).map(str::to_ascii_lowercase).as_deref() {
        Some("0x") => (&t[2..], 16),
        Some("0o") => (&t[2..], 8),
        Some("0b") => (&t[2..], 2),
        _ => (t, 10),
    };
    let v = u64::from_str_radix(digits, radix).map_err(|e| format!("invalid number {s:?}: {e}"))?;
    T::try_from(v).map_err(|_| format!("{s} is out of range"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let mut cfg = config::load();
    if let Some(device) = cli.device {
        cfg.device_path = device;
    }

    match cli.command {
        Command::Decode {
            capture,
            output,
            pretty,
            verify_checksums,
        } => decode(&capture, output.as_deref(), pretty, verify_checksums),
        Command::Request {
            tc,
            tid,
            cid,
            iid,
            flags,
            payload,
        } => {
            let rqst = Request::new(tc, tid, cid, iid)
                .with_flags(RequestFlags::from_bits(flags))
                .with_payload(payload)
                .with_response_capacity(cfg.response_capacity);
            run_request(&cfg, &rqst)
        }
        Command::Dtx { name } => {
            let Some(cmd) = commands::lookup(commands::DTX_COMMANDS, &name) else {
                bail!("invalid command: '{name}'");
            };
            run_request(&cfg, &cmd.request())
        }
        Command::Event {
            name,
            ev_tc,
            ev_seq,
            ev_iid,
        } => {
            let event = EventSpec {
                target_category: ev_tc,
                sequenced: ev_seq,
                instance_id: ev_iid,
            };
            let Some(rqst) = commands::event_request(&name, &event) else {
                bail!("invalid command: '{name}'");
            };
            run_request(&cfg, &rqst)
        }
        Command::Hid { command } => hid(&cfg, command),
        Command::TclDump {
            iid,
            buf_id,
            output,
        } => {
            let source = TraceBuffer {
                instance_id: iid,
                buffer_id: buf_id,
            };
            let mut ctrl = open(&cfg)?;
            let data = read_all(&mut ctrl, &source, cfg.tcl_chunk_size, &cfg.retry_policy())
                .with_context(|| format!("reading trace buffer {buf_id} of instance {iid}"))?;
            let path =
                output.unwrap_or_else(|| PathBuf::from(format!("tclbuf_iid{iid}_bufid{buf_id}.bin")));
            std::fs::write(&path, &data).with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {} bytes to {}", data.len(), path.display());
            Ok(())
        }
        Command::Version => {
            let mut ctrl = open(&cfg)?;
            let rsp = ctrl
                .request(&FirmwareVersion::request())
                .context("querying firmware version")?;
            match rsp.as_deref().and_then(FirmwareVersion::parse) {
                Some(v) => println!("firmware version: {v}"),
                None => bail!("unexpected firmware version response: {rsp:02x?}"),
            }
            Ok(())
        }
    }
}

fn open(cfg: &Config) -> Result<Controller<Device>> {
    let device = Device::open(&cfg.device_path)
        .with_context(|| format!("opening {}", cfg.device_path.display()))?;
    Ok(Controller::new(device))
}

fn run_request(cfg: &Config, rqst: &Request) -> Result<()> {
    let mut ctrl = open(cfg)?;
    let rsp = ctrl.request(rqst)?;
    if let Some(rsp) = rsp {
        println!("{}", hex_line(&rsp));
    }
    Ok(())
}

fn hid(cfg: &Config, command: HidCommand) -> Result<()> {
    let mut ctrl = open(cfg)?;
    let data = match command {
        HidCommand::LegacyGetDescriptor { entry } => {
            ctrl.request(&legacy_keyboard::get_descriptor(entry))?
        }
        HidCommand::LegacyGetFeatureReport { num } => {
            ctrl.request(&legacy_keyboard::get_feature_report(num))?
        }
        HidCommand::LegacySetCapslockLed { state } => {
            ctrl.request(&legacy_keyboard::set_capslock_led(state != 0))?;
            return Ok(());
        }
        HidCommand::GetDescriptor { iid, entry } => {
            let source = HidDescriptor {
                instance_id: iid,
                entry,
            };
            let data = read_all(&mut ctrl, &source, cfg.hid_chunk_size, &cfg.retry_policy())
                .with_context(|| format!("reading HID descriptor {entry} of instance {iid}"))?;
            Some(data)
        }
    };
    println!("{}", serde_json::to_string(&data.unwrap_or_default())?);
    Ok(())
}

fn decode(capture: &Path, output: Option<&Path>, pretty: bool, verify_checksums: bool) -> Result<()> {
    let raw = std::fs::read(capture).with_context(|| format!("reading {}", capture.display()))?;
    let bytes = ssam_core::extract_from_slice(&raw);
    log::info!("extracted {} payload bytes from {}", bytes.len(), capture.display());

    let mut decoder = Decoder::with_options(&bytes, DecoderOptions { verify_checksums });
    let records = (&mut decoder)
        .collect::<Result<Vec<Record>, _>>()
        .with_context(|| format!("decoding {}", capture.display()))?;
    log::info!(
        "decoded {} records ({} resync(s))",
        records.len(),
        decoder.resyncs()
    );

    let out: Box<dyn Write> = match output {
        Some(p) => Box::new(File::create(p).with_context(|| format!("creating {}", p.display()))?),
        None => Box::new(io::stdout().lock()),
    };
    let mut out = BufWriter::new(out);
    if pretty {
        serde_json::to_writer_pretty(&mut out, &records)?;
    } else {
        serde_json::to_writer(&mut out, &records)?;
    }
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn hex_line(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn int_radixes() {
        assert_eq!(parse_int::<u8>("0x15"), Ok(0x15));
        assert_eq!(parse_int::<u8>("0X0c"), Ok(0x0c));
        assert_eq!(parse_int::<u8>("12"), Ok(12));
        assert_eq!(parse_int::<u8>("0b101"), Ok(5));
        assert_eq!(parse_int::<u16>("0o17"), Ok(15));
        assert!(parse_int::<u8>("0x100").is_err());
        assert!(parse_int::<u8>("lock").is_err());
    }

    #[test]
    fn invalid_dtx_name_is_usage_error() {
        let err = Cli::try_parse_from(["ssam", "dtx", "explode"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
        assert!(Cli::try_parse_from(["ssam", "dtx", "get-opmode"]).is_ok());
    }

    #[test]
    fn request_args() {
        let cli = Cli::try_parse_from(["ssam", "request", "0x01", "1", "0x13", "0", "1", "0xaa", "5"]).unwrap();
        match cli.command {
            Command::Request { tc, cid, flags, payload, .. } => {
                assert_eq!((tc, cid, flags), (0x01, 0x13, 1));
                assert_eq!(payload, vec![0xaa, 5]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(hex_line(&[0x00, 0xab, 0x0f]), "00 ab 0f");
        assert_eq!(hex_line(&[]), "");
    }

    #[test]
    fn decode_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("capture.txt");
        let out = dir.path().join("out.json");
        std::fs::write(
            &capture,
            "Major function = Read\nData (Hexer)\n  00000000\taa 55 40 00 00 02 00 00 ff ff\t..\n\n",
        )
        .unwrap();
        decode(&capture, Some(&out), false, false).unwrap();
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!([{"ctrl": {"type": 64, "len": 0, "pad": 0, "seq": 2}}]));
    }

    #[test]
    fn decode_fails_on_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("capture.txt");
        std::fs::write(
            &capture,
            "Major function = Write\nData (Hexer)\n  00000000\taa 55 40 00 00 02 00 00 12 34\t..\n\n",
        )
        .unwrap();
        let err = decode(&capture, Some(&dir.path().join("out.json")), false, false).unwrap_err();
        assert!(format!("{err:#}").contains("terminator"));
    }
}
