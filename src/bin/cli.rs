//! sqlgate CLI Client
//!
//! Command-line interface for talking to a sqlgate server (plain TCP).

use std::net::TcpStream;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sqlgate::protocol::{read_reply, write_command, Command, Response, Status};

/// sqlgate CLI
#[derive(Parser, Debug)]
#[command(name = "sqlgate-cli")]
#[command(about = "CLI for the sqlgate server")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:15432")]
    server: String,

    /// Read timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a SQL statement
    Query {
        /// Statement text
        sql: String,
    },

    /// Ping the server
    Ping,
}

fn main() {
    let args = Args::parse();

    let mut stream = match TcpStream::connect(&args.server) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Cannot connect to {}: {}", args.server, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = stream.set_read_timeout(Some(Duration::from_secs(args.timeout))) {
        eprintln!("Cannot set read timeout: {}", e);
    }

    let command = match args.command {
        Commands::Query { sql } => Command::query(sql),
        Commands::Ping => Command::Ping,
    };

    let reply = write_command(&mut stream, &command).and_then(|_| read_reply(&mut stream));
    let responses = match reply {
        Ok(responses) => responses,
        Err(e) => {
            eprintln!("Request failed: {}", e);
            std::process::exit(1);
        }
    };

    let mut failed = false;
    for response in &responses {
        failed |= print_response(response);
    }

    // Polite goodbye; the server closes after it
    let _ = write_command(&mut stream, &Command::Terminate);

    if failed {
        std::process::exit(2);
    }
}

/// Print one response; returns true for an ERROR
fn print_response(response: &Response) -> bool {
    match response.status {
        Status::Row => match response.columns() {
            Ok(columns) => println!("{}", columns.join(" | ")),
            Err(e) => eprintln!("Malformed row: {}", e),
        },
        Status::Ok => println!("{}", response.text().unwrap_or_else(|| "OK".to_string())),
        Status::Pong => println!("PONG"),
        Status::Error => {
            eprintln!("ERROR: {}", response.text().unwrap_or_default());
            return true;
        }
    }
    false
}
