//! Demo driver: both bridge ports over host sockets, with loopback
//! UARTs standing in for the serial hardware.
//!
//! ```text
//! bridge --p0 server,telnet,2300,115200-8N1,idle=30 \
//!        --p1 client,raw,2301,9600-8N1,10.0.0.9:4000
//! ```

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::process::exit;

use getopts::Options;

use ser2eth_rs::bridge::Bridge;
use ser2eth_rs::config::{ConfigParameters, ConfigStore, MemConfigStore, PortConfig, MAX_PORTS};
use ser2eth_rs::parsers::LineSettings;
use ser2eth_rs::phy::{sys, SysTcpStack};
use ser2eth_rs::session::TICK_MS;
use ser2eth_rs::time::{Duration, Instant};
use ser2eth_rs::uart::SimUart;

fn usage(opts: &Options) -> ! {
    let brief = "Usage: bridge [options]\n\n\
                 Port spec: ROLE,PROTOCOL,LOCAL_PORT,LINE[,idle=SECS][,ADDR:PORT]\n\
                 e.g. server,telnet,2300,115200-8N1,idle=30\n\
                 or   client,raw,2301,9600-8N1,10.0.0.9:4000";
    print!("{}", opts.usage(brief));
    exit(1)
}

fn parse_port_spec(index: usize, spec: &str) -> Result<PortConfig, String> {
    let mut cfg = PortConfig::factory(index);
    let parts: Vec<&str> = spec.split(',').collect();
    if parts.len() < 4 {
        return Err(format!("port {index}: expected ROLE,PROTOCOL,LOCAL_PORT,LINE"));
    }
    cfg.role = parts[0]
        .parse()
        .map_err(|_| format!("port {index}: bad role {:?}", parts[0]))?;
    cfg.protocol = parts[1]
        .parse()
        .map_err(|_| format!("port {index}: bad protocol {:?}", parts[1]))?;
    cfg.local_port = parts[2]
        .parse()
        .map_err(|_| format!("port {index}: bad local port {:?}", parts[2]))?;
    let line: LineSettings = parts[3]
        .parse()
        .map_err(|_| format!("port {index}: bad line settings {:?}", parts[3]))?;
    cfg.baud_rate = line.baud_rate;
    cfg.data_bits = line.data_bits;
    cfg.parity = line.parity;
    cfg.stop_bits = line.stop_bits;

    for extra in &parts[4..] {
        if let Some(idle) = extra.strip_prefix("idle=") {
            cfg.idle_timeout_secs = idle
                .parse()
                .map_err(|_| format!("port {index}: bad idle timeout {idle:?}"))?;
        } else if let Ok(remote) = extra.parse::<SocketAddrV4>() {
            cfg.remote_addr = *remote.ip();
            cfg.remote_port = remote.port();
        } else {
            return Err(format!("port {index}: unrecognized option {extra:?}"));
        }
    }

    cfg.sanitize();
    cfg.validate().map_err(|err| format!("port {index}: {err}"))?;
    Ok(cfg)
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = Options::new();
    opts.optopt("", "p0", "port 0 spec", "SPEC");
    opts.optopt("", "p1", "port 1 spec", "SPEC");
    opts.optopt("t", "tick", "poll tick in milliseconds", "MS");
    opts.optflag("h", "help", "print this help");
    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{err}");
            usage(&opts)
        }
    };
    if matches.opt_present("h") {
        usage(&opts);
    }

    let mut params = ConfigParameters::default();
    for (index, flag) in ["p0", "p1"].iter().copied().enumerate() {
        if let Some(spec) = matches.opt_str(flag) {
            match parse_port_spec(index, &spec) {
                Ok(cfg) => params.ports[index] = cfg,
                Err(err) => {
                    eprintln!("{err}");
                    usage(&opts)
                }
            }
        }
    }
    let tick_ms: u64 = matches
        .opt_str("tick")
        .map(|t| t.parse().unwrap_or(TICK_MS as u64))
        .unwrap_or(TICK_MS as u64);

    // The volatile store plays the part of the parameter flash.
    let store = MemConfigStore::new(params);
    let params = store.load();

    let devices: Vec<SimUart> = (0..MAX_PORTS)
        .map(|_| {
            let mut uart = SimUart::new();
            uart.set_loopback(true);
            uart
        })
        .collect();
    let mut stacks: Vec<SysTcpStack> = (0..MAX_PORTS).map(|_| SysTcpStack::new()).collect();

    let mut bridge = Bridge::new(params.ports.to_vec(), devices);
    if let Err(err) = bridge.start(&mut stacks) {
        eprintln!("failed to start: {err}");
        exit(1);
    }
    for index in 0..bridge.num_ports() {
        log::info!("port {}: {}", index, bridge.diag(index));
    }

    let tick = Duration::from_millis(tick_ms);
    let mut next_tick = Instant::now() + tick;
    loop {
        let now = Instant::now();
        if now < next_tick {
            let mut fds: Vec<RawFd> = Vec::new();
            for stack in &stacks {
                stack.pollable_fds(&mut fds);
            }
            if let Err(err) = sys::wait(&fds, Some(next_tick - now)) {
                log::warn!("wait failed: {err}");
            }
        }

        // Sockets may have woken us early; move bytes promptly either
        // way, and advance the wire of the loopback UARTs.
        bridge.pump_events(&mut stacks);
        for index in 0..bridge.num_ports() {
            bridge.port_mut(index).serial_mut().device_mut().step();
        }

        if Instant::now() >= next_tick {
            bridge.poll(&mut stacks);
            next_tick += tick;
        }
    }
}
