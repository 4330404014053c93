//! Interactive command-line client for an EmberKV server.

use clap::Parser;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;

#[derive(Parser, Debug)]
#[command(name = "emberkv-client", about = "EmberKV interactive client")]
struct Args {
    /// Server address
    #[arg(long, default_value = "localhost:8080")]
    addr: String,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let stream = TcpStream::connect(&args.addr)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    println!("Connected to {}", args.addr);
    println!("Commands: read <key> | write <key>|<value> | delete <key> | status | keys | reads <prefix> | quit");
    println!();

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\r")?;
        writer.flush()?;

        let response = read_frame(&mut reader)?;
        println!("{}", String::from_utf8_lossy(&response));
    }

    Ok(())
}

/// Reads one `\r`-terminated response frame.
fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut frame = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 || byte[0] == b'\r' {
            return Ok(frame);
        }
        frame.push(byte[0]);
    }
}
