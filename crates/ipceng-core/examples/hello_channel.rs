//! Basic usage example - two engines exchange a message and share a region

use ipceng::{ChannelOptions, Engine, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Names from args or defaults
    let mut args = std::env::args().skip(1);
    let name_a = args.next().unwrap_or_else(|| "A".to_string());
    let name_b = args.next().unwrap_or_else(|| "B".to_string());

    let mut a = Engine::init(&name_a)?;
    let mut b = Engine::init(&name_b)?;

    a.add_channel(&name_b, &ChannelOptions::default())?;
    b.add_channel(&name_a, &ChannelOptions::default())?;

    a.send_text(&name_b, "hello world!", 0)?;
    let message = b.receive(&name_a)?;
    println!(
        "{} got {:?} ({} bytes, priority {})",
        name_b,
        message.text(),
        message.len(),
        message.priority
    );

    let region = format!("{}-{}", name_a, name_b);
    a.add_region(&region, 13)?;
    b.add_region(&region, 13)?;
    a.write_region(&region, 0, b"hello world!\0")?;
    let bytes = b.read_region(&region, 0, 13)?;
    println!("{} read {:?} from region {}", name_b, String::from_utf8_lossy(&bytes), region);

    a.delete_all_channels()?;
    b.delete_all_channels()?;
    a.delete_all_regions()?;
    b.delete_all_regions()?;

    if let Err(failure) = a.terminate() {
        eprintln!("{}", failure);
    }
    if let Err(failure) = b.terminate() {
        eprintln!("{}", failure);
    }
    Ok(())
}
