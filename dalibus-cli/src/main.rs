use std::cell::RefCell;
use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};

use dalibus::cache::DeviceInfoCache;
use dalibus::discovery::Collector;
use dalibus::{BridgeConnection, BusConfig, DaliAddress, DaliComm};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + 'static>>;

const PUMP_INTERVAL: Duration = Duration::from_millis(50);

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

fn run() -> Result<()> {
    let matches = Command::new("dalibus")
        .about("DALI bus diagnostics via a serial bridge")
        .arg(
            Arg::new("connect")
                .short('c')
                .long("connect")
                .value_name("ADDRESS")
                .help("Bridge address, e.g. tcp:host:port or unix:/path"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Bus configuration file (JSON)"),
        )
        .arg(
            Arg::new("legacy")
                .long("legacy")
                .action(ArgAction::SetTrue)
                .help("Accept identity checksums with the historical bug signature"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("scan").about("Probe all 64 short addresses and print the bus state"))
        .subcommand(
            Command::new("devices")
                .about("Scan the bus and list devices with their identities")
                .arg(
                    Arg::new("full")
                        .long("full")
                        .action(ArgAction::SetTrue)
                        .help("Force the exhaustive binary-search scan"),
                )
                .arg(
                    Arg::new("cache")
                        .long("cache")
                        .value_name("FILE")
                        .help("Identity cache file reused across runs"),
                ),
        )
        .subcommand(
            Command::new("info")
                .about("Read one device's identity record")
                .arg(Arg::new("addr").required(true).value_name("ADDR")),
        )
        .subcommand(
            Command::new("cmd")
                .about("Issue a direct command to a device, group or the whole bus")
                .arg(Arg::new("addr").required(true).value_name("ADDR"))
                .arg(Arg::new("what").required(true).value_parser(["max", "min", "off", "pulse"])),
        )
        .get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => BusConfig::load(&PathBuf::from(path))?,
        None => BusConfig::default(),
    };
    if let Some(connect) = matches.get_one::<String>("connect") {
        config.connection = connect.clone();
    }
    if matches.get_flag("legacy") {
        config.legacy_checksum_compat = true;
    }
    if config.connection.is_empty() {
        return Err("no bridge address; pass --connect or a config file".into());
    }

    let (mut comm, mut connection) = DaliComm::open(&config, &config.connection)?;

    match matches.subcommand() {
        Some(("scan", _)) => {
            let slot = Rc::new(RefCell::new(None));
            let out = slot.clone();
            comm.probe_scan(move |_, res| {
                *out.borrow_mut() = Some(res);
            });
            let state = drive_until(&mut comm, &mut connection, slot)??;
            println!("{}", state);
            println!("(*: device, C: collision, .: silent, E: error)");
        }
        Some(("devices", sub)) => {
            let cache_path = sub.get_one::<String>("cache").map(PathBuf::from);
            let cache = cache_path
                .as_deref()
                .map(DeviceInfoCache::load_or_default)
                .unwrap_or_default();
            let incremental = !cache.is_empty();
            let collector = Collector::new(cache);
            let slot = Rc::new(RefCell::new(None));
            let out = slot.clone();
            collector.collect(
                &mut comm,
                incremental,
                sub.get_flag("full"),
                move |_, res| {
                    *out.borrow_mut() = Some(res);
                },
            );
            let devices = drive_until(&mut comm, &mut connection, slot)??;
            for device in &devices {
                println!(
                    "{:>2}  {:<14} gtin {:<15} serial {:<12} id {}",
                    device.info.short_address,
                    format!("{:?}", device.info.status),
                    device.info.gtin,
                    device.info.serial_no,
                    device.stable_id
                );
            }
            if let Some(path) = cache_path {
                collector.cache_snapshot().save(&path)?;
            }
        }
        Some(("info", sub)) => {
            let addr = parse_short_address(sub.get_one::<String>("addr").unwrap())?;
            let slot = Rc::new(RefCell::new(None));
            let out = slot.clone();
            comm.read_device_info(addr, move |_, res| {
                *out.borrow_mut() = Some(res);
            });
            let info = drive_until(&mut comm, &mut connection, slot)??;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Some(("cmd", sub)) => {
            let address = parse_address(sub.get_one::<String>("addr").unwrap())?;
            match sub.get_one::<String>("what").unwrap().as_str() {
                "max" => comm.send_direct_power(address, 0xFE, None, None),
                "min" => comm.send_direct_power(address, 0x01, None, None),
                "off" => comm.send_direct_power(address, 0x00, None, None),
                "pulse" => {
                    comm.send_direct_power(address, 0xFE, None, None);
                    comm.send_direct_power(
                        address,
                        0x01,
                        None,
                        Some(Duration::from_millis(1200)),
                    );
                }
                _ => unreachable!(),
            }
            drain(&mut comm, &mut connection)?;
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Pump the connection until the callback delivered into `slot`.
fn drive_until<T: 'static>(
    comm: &mut DaliComm,
    connection: &mut BridgeConnection,
    slot: Rc<RefCell<Option<T>>>,
) -> Result<T> {
    loop {
        if let Some(value) = slot.borrow_mut().take() {
            return Ok(value);
        }
        connection.pump(PUMP_INTERVAL, comm.queue_mut())?;
    }
}

/// Pump until all queued transactions finished.
fn drain(comm: &mut DaliComm, connection: &mut BridgeConnection) -> Result<()> {
    while !comm.queue_mut().is_empty() {
        connection.pump(PUMP_INTERVAL, comm.queue_mut())?;
    }
    Ok(())
}

fn parse_short_address(text: &str) -> Result<u8> {
    let addr: u8 = text.parse().map_err(|_| format!("invalid short address '{}'", text))?;
    if addr > 63 {
        return Err(format!("short address {} out of range 0..63", addr).into());
    }
    Ok(addr)
}

fn parse_address(text: &str) -> Result<DaliAddress> {
    if text == "all" || text == "broadcast" {
        return Ok(DaliAddress::Broadcast);
    }
    if let Some(group) = text.strip_prefix("group:") {
        let no: u8 = group.parse().map_err(|_| format!("invalid group '{}'", text))?;
        if no > 15 {
            return Err(format!("group {} out of range 0..15", no).into());
        }
        return Ok(DaliAddress::Group(no));
    }
    Ok(DaliAddress::Short(parse_short_address(text)?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_parsing() {
        assert_eq!(parse_address("5").unwrap(), DaliAddress::Short(5));
        assert_eq!(parse_address("group:3").unwrap(), DaliAddress::Group(3));
        assert_eq!(parse_address("all").unwrap(), DaliAddress::Broadcast);
        assert!(parse_address("64").is_err());
        assert!(parse_address("group:16").is_err());
    }
}
