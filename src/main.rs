use std::env;

use anyhow::anyhow;
use log::info;
use meteread::{ClientConfig, MeterClient, ResponseKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let default_filter = env::var("METEREAD_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    // Connect to the named device, or the first one found
    let wanted = env::args().nth(1);

    let config = ClientConfig::default();
    let client = MeterClient::new_default(config.clone()).await?;

    let devices = client
        .scan()
        .await?
        .ok_or(anyhow!("A scan is already running"))?
        .collect_devices()
        .await?;
    info!("Found {} device(s)", devices.len());

    let device = devices
        .into_iter()
        .find(|d| wanted.is_none() || d.name == wanted)
        .ok_or(anyhow!("Device not found"))?;

    let session = client.connect(device).await?;

    let result = async {
        let snapshot = client.fetch_snapshot(&session).await?;
        println!("{:#?}", snapshot.info);
        match snapshot.reading {
            Ok(reading) => println!("Battery voltage ({}): {}", reading.obis, reading.value),
            Err(err) => println!("Battery voltage unavailable: {err}"),
        }

        match client.fetch_battery_level(&session).await {
            Ok(level) => println!("Battery level: {level}%"),
            Err(err) => println!("Battery level unavailable: {err}"),
        }

        let total = client
            .fetch_metering_value(&session, config.reading_obis.as_bytes(), ResponseKind::MeterReading)
            .await?;
        println!("Meter reading ({}): {total}", config.reading_obis);
        anyhow::Ok(())
    }
    .await;

    client.shutdown().await?;
    result
}
