use std::process;

fn main() {
    if let Err(e) = rdmaswap_ctl::run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
