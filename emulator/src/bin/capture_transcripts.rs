use std::io;
use std::path::Path;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::Session;

const CONSOLE_LOG: &str = "transcripts/emulator-console.log";
const CRANKING_LOG: &str = "transcripts/emulator-cranking.log";

fn main() -> io::Result<()> {
    record_console(&mut Session::new(Path::new(CONSOLE_LOG), 0.0)?)?;
    record_cranking(&mut Session::new(Path::new(CRANKING_LOG), 0.0)?)?;
    Ok(())
}

fn record_console(session: &mut Session) -> io::Result<()> {
    for line in [
        "si#",
        "sn100#",
        "wf100,8,5.37,0.25,0.5,0.01,0.1,0.5,0.01,0,4#",
        "sn100#",
        "wf100,2,3,1,2#",
        "sc2#",
        "si#",
        "ra#",
    ] {
        let _ = session.handle_command(line)?;
    }
    Ok(())
}

fn record_cranking(session: &mut Session) -> io::Result<()> {
    for line in [
        "sensor coolant 1500",
        "rpm 200",
        "run 2000",
        "status",
        "rpm 1500",
        "run 3000",
        "status",
        "sd#",
        "rpm 0",
        "run 3000",
        "status",
    ] {
        let _ = session.handle_command(line)?;
    }
    Ok(())
}
