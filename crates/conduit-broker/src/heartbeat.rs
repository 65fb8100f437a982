//! Peer liveness. One long-lived TCP connection, guest-dials-host, carrying
//! no traffic: whichever side sees the blocking read return assumes the
//! peer rebooted and re-executes itself, which also reinitialises the rings.

use std::{
    io::Read,
    net::{TcpListener, TcpStream},
    os::unix::process::CommandExt,
    process::Command,
    thread,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;

pub fn heartbeat_loop(config: &BrokerConfig) -> ! {
    let endpoint = (config.server_address.as_str(), config.server_port);
    let mut stream = if config.is_guest { connect(endpoint) } else { accept(endpoint) };
    info!("heartbeat up");

    let mut buf = [0u8; 1];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%e, "heartbeat read failed");
                break;
            }
        }
    }
    restart()
}

fn connect(endpoint: (&str, u16)) -> TcpStream {
    loop {
        match TcpStream::connect(endpoint) {
            Ok(stream) => return stream,
            Err(e) => {
                debug!(%e, "host heartbeat not up yet");
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

fn accept(endpoint: (&str, u16)) -> TcpStream {
    let listener = loop {
        match TcpListener::bind(endpoint) {
            Ok(listener) => break listener,
            Err(e) => {
                warn!(%e, "couldn't bind heartbeat endpoint");
                thread::sleep(Duration::from_secs(1));
            }
        }
    };
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!(%addr, "guest heartbeat connected");
                return stream;
            }
            Err(e) => warn!(%e, "heartbeat accept failed"),
        }
    }
}

/// Re-exec the current binary with its original argv. In-flight frames are
/// considered undelivered; clients re-establish their streams.
fn restart() -> ! {
    warn!("heartbeat lost, re-executing");
    let mut args = std::env::args_os();
    let argv0 = args.next().unwrap_or_else(|| "conduit-broker".into());
    let err = Command::new(&argv0).args(args).exec();
    // exec only returns on failure
    error!(%err, "couldn't re-exec");
    std::process::exit(1);
}
