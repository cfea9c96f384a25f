#[macro_use]
extern crate log;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;

mod command_demo;
mod command_keygen;

use command_demo::*;
use command_keygen::*;

const DEFAULT_RELAY: &str = "ws://localhost:7000";

#[tokio::main]
async fn main() {
    let matches = App::new("blindvote")
        .version("0.1.0")
        .author("Patrick Hayes <patrick.d.hayes@gmail.com>")
        .about("Anonymous voting with blind signatures")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("debug")
                .long("debug")
                .global(true)
                .help("Log debug output"),
        )
        .arg(
            Arg::with_name("relay")
                .long("relay")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .global(true)
                .help("Relay URL, may be repeated - can also be set with BLINDVOTE_RELAYS"),
        )
        .subcommand(
            SubCommand::with_name("keygen")
                .about("Generate an election commission RSA key")
                .arg(
                    Arg::with_name("bits")
                        .long("bits")
                        .takes_value(true)
                        .default_value("2048")
                        .help("Modulus size in bits, at least 2048"),
                ),
        )
        .subcommand(
            SubCommand::with_name("demo")
                .about("Run an election with simulated voters over an in-process relay")
                .arg(
                    Arg::with_name("voters")
                        .long("voters")
                        .takes_value(true)
                        .default_value("5")
                        .help("Number of voters"),
                ),
        )
        .get_matches();

    let (name, sub_matches) = matches.subcommand();
    let debug = matches.is_present("debug") || sub_matches.map_or(false, |m| m.is_present("debug"));
    init_logging(debug);

    match (name, sub_matches) {
        ("keygen", Some(sub_matches)) => command_keygen(sub_matches),
        ("demo", Some(sub_matches)) => {
            let relays = relays(&matches, sub_matches);
            command_demo(sub_matches, relays).await
        }
        _ => {
            eprintln!("{}", matches.usage());
            std::process::exit(1);
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S%.3f)} {h({l:5})} {t} - {m}{n}")))
        .build();

    let config = LogConfig::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level));

    let result = config
        .map_err(|e| e.to_string())
        .and_then(|config| log4rs::init_config(config).map_err(|e| e.to_string()));
    if let Err(e) = result {
        eprintln!("blindvote: unable to initialise logging: {}", e);
        std::process::exit(1);
    }
    debug!("Initialised logging");
}

// --relay wins over BLINDVOTE_RELAYS, which wins over the default
fn relays(matches: &ArgMatches, sub_matches: &ArgMatches) -> Vec<String> {
    let given = sub_matches
        .values_of("relay")
        .or_else(|| matches.values_of("relay"));
    if let Some(values) = given {
        return values.map(str::to_owned).collect();
    }

    let from_env = std::env::var("BLINDVOTE_RELAYS")
        .map(|value| blindvote::parse_relays(&value))
        .unwrap_or_default();
    if from_env.is_empty() {
        vec![DEFAULT_RELAY.to_owned()]
    } else {
        from_env
    }
}

pub(crate) fn exit_with(command: &str, message: impl std::fmt::Display) -> ! {
    eprintln!("blindvote {}: {}", command, message);
    std::process::exit(1);
}
