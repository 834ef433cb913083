//! Command-line argument parsing

pub struct Args {
    pub validate: bool,
    pub help: bool,
}

pub fn parse_args() -> Args {
    parse_args_from(std::env::args().collect())
}

fn parse_args_from(args: Vec<String>) -> Args {
    let mut result = Args {
        validate: false,
        help: false,
    };

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--validate" => result.validate = true,
            "--help" | "-h" => result.help = true,
            _ => {}
        }
    }

    result
}

pub fn print_help() {
    println!("sipbounce - minimal SIP B2BUA with RTP relay\n");
    println!("USAGE:");
    println!("    sipbounce [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --validate              Validate configuration and exit");
    println!("    --help, -h              Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    See .env.example for required configuration variables");
}
