mod cli;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    argus::pipeline::telemetry::init_tracing();
    cli::dispatch()
}
