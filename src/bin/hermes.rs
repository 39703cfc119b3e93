// Copyright 2017-2019 Sean Gillespie.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process;
use std::sync::mpsc;
use std::thread;

use clap::{App, Arg, ArgMatches, SubCommand};
use hermes::transport::Message;
use hermes::{notation, Dialect, HostConfig, ProcessHost};

fn main() {
    env_logger::init();
    let matches = App::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand(
            SubCommand::with_name("serve")
                .about("Run the engine process host")
                .arg(
                    Arg::with_name("config")
                        .help("Path to a JSON configuration file")
                        .value_name("FILE")
                        .short("-c")
                        .long("--config")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("translate")
                .about("Translate a move list between protocol dialects")
                .arg(
                    Arg::with_name("MOVES")
                        .help("Whitespace-separated move list")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("from")
                        .help("Source dialect (UCI, UCI_CYCLONE, USI, UCCI)")
                        .value_name("DIALECT")
                        .long("--from")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("to")
                        .help("Target dialect")
                        .value_name("DIALECT")
                        .long("--to")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("width")
                        .help("Board width in files")
                        .value_name("WIDTH")
                        .short("-w")
                        .long("--width")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("height")
                        .help("Board height in ranks")
                        .value_name("HEIGHT")
                        .long("--height")
                        .takes_value(true),
                ),
        )
        .get_matches();

    if let Some(matches) = matches.subcommand_matches("translate") {
        run_translate(matches);
    }

    let config = if let Some(matches) = matches.subcommand_matches("serve") {
        match matches.value_of("config") {
            Some(path) => match HostConfig::from_file(path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("failed to read config `{}`: {}", path, e);
                    process::exit(1);
                }
            },
            None => HostConfig::default(),
        }
    } else {
        HostConfig::default()
    };
    run_serve(config);
}

fn run_translate(matches: &ArgMatches) -> ! {
    let moves = matches.value_of("MOVES").unwrap();
    let from = dialect_or_exit(matches.value_of("from").unwrap());
    let to = dialect_or_exit(matches.value_of("to").unwrap());
    let width = value_t!(matches, "width", u32).unwrap_or(8);
    let height = value_t!(matches, "height", u32).unwrap_or(8);

    match notation::convert_move_list(moves, from, to, width, height) {
        Some(converted) => {
            println!("{}", converted);
            process::exit(0);
        }
        None => {
            eprintln!("untranslatable move list for {} -> {}", from, to);
            process::exit(1);
        }
    }
}

fn dialect_or_exit(name: &str) -> Dialect {
    match Dialect::from_wire(name) {
        Some(dialect) => dialect,
        None => {
            eprintln!("unknown dialect `{}`", name);
            process::exit(1);
        }
    }
}

fn run_serve(config: HostConfig) -> ! {
    let listener = match TcpListener::bind(&config.listen) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {}: {}", config.listen, e);
            process::exit(1);
        }
    };
    info!("listening on {}", config.listen);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to accept connection: {}", e);
                continue;
            }
        };
        let config = config.clone();
        thread::Builder::new()
            .name("connection".to_owned())
            .spawn(move || {
                if let Err(e) = serve_connection(stream, &config) {
                    warn!("connection ended with error: {}", e);
                }
            })
            .ok();
    }
    process::exit(0);
}

/// Serves one client connection: validate the handshake, then pump decoded
/// frames into a dedicated process host until the client goes away. Every
/// engine process spawned for the connection dies with it.
fn serve_connection(stream: TcpStream, config: &HostConfig) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    info!("client connected from {}", peer);

    let mut reader = BufReader::new(stream.try_clone()?);
    let (outbound, rx) = mpsc::channel::<Message>();
    let host = ProcessHost::new(outbound, PathBuf::from(&config.registry_path));

    let mut write_half = stream;
    thread::Builder::new()
        .name("connection-writer".to_owned())
        .spawn(move || {
            for message in rx {
                if writeln!(write_half, "{}", message.encode()).is_err() {
                    break;
                }
            }
        })
        .ok();

    // The first frame must be the CONNECT handshake; when a token is
    // configured it must match.
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(());
    }
    match Message::decode(line.trim_end_matches('\n')) {
        Ok(Message::Connect { code }) => {
            if !config.connect_token.is_empty() && code != config.connect_token {
                warn!("client {} presented a bad connect token", peer);
                return Ok(());
            }
        }
        other => {
            warn!("client {} skipped the handshake: {:?}", peer, other);
            return Ok(());
        }
    }

    // The client follows its CONNECT with a READYOK frame; the dispatch
    // loop consumes it without a reply.
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let frame = line.trim_end_matches('\n');
        if frame.is_empty() {
            continue;
        }
        match Message::decode(frame) {
            // A zero timeout defers to the configured default.
            Ok(Message::LoadEngine {
                id,
                slot,
                dialect,
                command,
                workdir,
                timeout_ms: 0,
            }) => host.handle(Message::LoadEngine {
                id,
                slot,
                dialect,
                command,
                workdir,
                timeout_ms: config.default_timeout_ms,
            }),
            Ok(message) => host.handle(message),
            Err(e) => warn!("undecodable frame from {}: {:?}", peer, e),
        }
    }

    info!("client {} disconnected", peer);
    host.shutdown();
    Ok(())
}
