mod session;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use session::Session;

const DEFAULT_TRANSCRIPT: &str = "emulator-session.log";

struct Options {
    rpm: f32,
    transcript: PathBuf,
}

fn main() -> io::Result<()> {
    let options = parse_options().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("Usage: ecu-emulator [--rpm <value>] [--transcript <path>]");
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(&options.transcript, options.rpm)?;
    let mut line = String::new();

    writeln!(
        writer,
        "ECU emulator ready. Type `help` for commands or `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        let responses = session.handle_command(trimmed)?;
        for response in responses {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_options() -> Result<Options, String> {
    let mut options = Options {
        rpm: 0.0,
        transcript: PathBuf::from(DEFAULT_TRANSCRIPT),
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let mut value = || {
            inline
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| format!("Expected value after {flag}"))
        };
        match flag.as_str() {
            "--rpm" => {
                let text = value()?;
                options.rpm = text
                    .parse::<f32>()
                    .ok()
                    .filter(|rpm| *rpm >= 0.0)
                    .ok_or_else(|| format!("Invalid rpm `{text}`"))?;
            }
            "--transcript" => options.transcript = PathBuf::from(value()?),
            _ => return Err(format!("Unknown argument `{flag}`")),
        }
    }
    Ok(options)
}
