//! Locate the etee dongle among the system's serial ports.

fn main() {
    env_logger::init();

    match etee::transport::discover() {
        Ok(port) => println!("etee dongle at {}", port),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
