//! Discover a unit, connect and print live sensor values
//!
//! ```text
//! cargo run --example monitor -- <pin> [address]
//! RUST_LOG=comfoair=debug cargo run --example monitor -- 0
//! ```

use comfoair::properties::{
    EXHAUST_FAN_SPEED, EXTRACT_AIR_TEMPERATURE, FAN_SPEED_SETTING, OUTDOOR_AIR_TEMPERATURE,
    SUPPLY_AIR_TEMPERATURE, SUPPLY_FAN_SPEED,
};
use comfoair::{
    discover, properties, ClientConfig, ComfoControlClient, DiscoveryConfig, SessionEvent,
    UnitDescriptor, DEFAULT_PORT,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("comfoair=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let pincode: u32 = args.next().unwrap_or_else(|| "0".to_string()).parse()?;

    let unit = match args.next() {
        Some(address) => UnitDescriptor::new("manual", address, DEFAULT_PORT),
        None => {
            println!("Discovering units...");
            let units = discover(&DiscoveryConfig::default()).await?;
            for unit in &units {
                println!(
                    "  {} {} at {}",
                    unit.uuid(),
                    unit.model().unwrap_or("unknown model"),
                    unit.address()
                );
            }
            match units.into_iter().next() {
                Some(unit) => unit,
                None => {
                    println!("No unit found");
                    return Ok(());
                }
            }
        }
    };

    let client = ComfoControlClient::new(unit, pincode, ClientConfig::default());
    let mut events = client.events();
    client.connect().await?;

    let info = client.node_info().await?;
    println!(
        "Connected to {} (serial {}, firmware {})",
        info.model, info.serial_number, info.firmware_version
    );

    for descriptor in [
        FAN_SPEED_SETTING,
        SUPPLY_FAN_SPEED,
        EXHAUST_FAN_SPEED,
        SUPPLY_AIR_TEMPERATURE,
        EXTRACT_AIR_TEMPERATURE,
        OUTDOOR_AIR_TEMPERATURE,
    ] {
        client
            .register_property_listener(descriptor.id, |_| {})
            .await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event? {
                SessionEvent::PropertyChanged(value) => {
                    let name = properties::lookup(value.id).map_or("?", |d| d.name);
                    let unit = properties::lookup(value.id).and_then(|d| d.unit).unwrap_or("");
                    println!("{:<40} {} {}", name, value.value, unit);
                }
                SessionEvent::StateChanged(state) => println!("Session is {:?}", state),
                SessionEvent::Failed(reason) => {
                    println!("Session failed: {}", reason);
                    break;
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}
