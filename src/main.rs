use clap::Parser;

use ike::cli::{run, Mode};

fn main() {
    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        hook(panic_info);
        eprintln!("unrecoverable error");
        std::process::exit(666);
    }));

    run(Mode::parse());
}
