//! `reeld`, the NDMP agent daemon.
//!
//! Listens on a TCP port and runs one isolated session per connection.
//! With `-T` it prints `READY` once the listener is up and exits when
//! stdin reaches EOF, for use under test harnesses.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::process::exit;

use clap::Parser;
use reel::session::{serve, ServeError};
use reel::SessionConfig;
use reel_tape::TapeLimits;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reeld", about = "NDMP tape agent daemon", version)]
struct Args {
    /// TCP port to listen on.
    #[arg(short, long, default_value_t = 10000)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    address: IpAddr,

    /// Simulated tape capacity in bytes; unlimited when absent.
    #[arg(long)]
    tape_limit: Option<u64>,

    /// Test mode: print READY once listening and exit when stdin closes.
    #[arg(short = 'T', long)]
    test_daemon: bool,
}

fn watch_stdin() {
    let mut buf = [0u8; 32];
    let mut stdin = std::io::stdin();
    loop {
        match stdin.read(&mut buf) {
            Ok(0) | Err(_) => {
                println!("DONE");
                let _ = std::io::stdout().flush();
                exit(0);
            }
            Ok(_) => {}
        }
    }
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let config = SessionConfig { tape_limits: args.tape_limit.map(TapeLimits::new) };

    let listener = match TcpListener::bind((args.address, args.port)) {
        Ok(l) => l,
        Err(e) => {
            error!(err = %e, port = args.port, "bind failed");
            exit(2);
        }
    };

    if args.test_daemon {
        // The invoker waits for this line before connecting.
        println!("READY");
        let _ = std::io::stdout().flush();
        std::thread::spawn(watch_stdin);
    }

    match serve(listener, config) {
        Err(ServeError::Accept(e)) => {
            error!(err = %e, "accept failed");
            exit(4);
        }
        Err(ServeError::Spawn(e)) => {
            error!(err = %e, "spawn failed");
            exit(5);
        }
        Ok(()) => {}
    }
}
