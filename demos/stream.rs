//! Stream decoded controller telemetry to stdout.
//!
//! Usage: cargo run --example stream
//! Press Ctrl+C to stop.

use etee::{Device, Hand};
use std::time::Duration;

fn main() {
    env_logger::init();

    let mut device = match Device::open_first() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to open dongle: {}", e);
            std::process::exit(1);
        }
    };

    println!("Port: {}", device.port_name());
    println!("Waiting for controllers (Ctrl+C to stop)...");

    let mut tick: u64 = 0;
    loop {
        device.poll();
        tick += 1;

        // Print every ~50th tick to avoid flooding the terminal
        if tick % 50 == 0 {
            for hand in Hand::BOTH {
                if !device.is_hand_connected(hand) {
                    continue;
                }
                let rot = device.rotations(hand);
                let (x, y) = device.trackpad_position(hand);
                println!(
                    "{hand:>5}  bat={:>3.0}  pull={:?}  pad=({:>3},{:>3})  rpy=[{:+7.2}, {:+7.2}, {:+7.2}]",
                    device.battery(hand),
                    device.fingers_pull(hand),
                    x,
                    y,
                    rot.x,
                    rot.y,
                    rot.z,
                );
            }
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}
