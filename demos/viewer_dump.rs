//! A minimal viewer client: connects to a running `termc` server and dumps
//! whatever it sends straight to stdout.
//!
//! Grounded in `crates/sshx/examples/stdin_client.rs`'s connect-and-pump
//! shape, stripped to one direction (a viewer is read-only, §1's non-goals)
//! and to a plain blocking socket instead of `tokio`, since this is just a
//! demonstration client, not part of the server itself.

use std::env;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = match args.next() {
        Some(p) => match p.parse() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("termc-viewer: invalid port {p:?}");
                return ExitCode::FAILURE;
            }
        },
        None => 8080,
    };

    let mut stream = match TcpStream::connect((host.as_str(), port)) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("termc-viewer: failed to connect to {host}:{port}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if stdout.write_all(&buf[..n]).is_err() {
                    break;
                }
                let _ = stdout.flush();
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                eprintln!("termc-viewer: read error: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
