use clap::Parser;

fn main() {
    let cli = podcastctl::Cli::parse();
    match podcastctl::run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}
