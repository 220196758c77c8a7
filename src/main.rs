use std::process;

fn main() {
    if let Err(err) = tallyline::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}
