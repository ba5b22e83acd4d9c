mod sensor;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use sensor::SimulatedSensor;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Impersonates breath sensors publishing alcohol readings to a broker.
#[derive(Debug, Parser)]
#[command(name = "alcowatch-simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    /// Device ids are `<prefix><n>`
    #[arg(long, env = "DEVICE_PREFIX", default_value = "D")]
    device_prefix: String,

    /// Each device publishes to `<topic-prefix>/<deviceId>`
    #[arg(long, env = "TOPIC_PREFIX", default_value = "sensors")]
    topic_prefix: String,

    #[arg(long, env = "PUBLISH_INTERVAL_MS", default_value_t = 1000)]
    interval_ms: u64,

    /// Share of devices reporting drunk levels
    #[arg(long, env = "DRUNK_RATIO", default_value_t = 0.2)]
    drunk_ratio: f64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting alcowatch simulator");
    info!(
        "Broker: {}:{}, Devices: {}, Interval: {}ms",
        args.broker, args.port, args.devices, args.interval_ms
    );

    let mut rng = rand::thread_rng();
    let client_id = format!("alcowatch-sim-{}", rng.gen::<u32>());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    // Spawn eventloop handler
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let drunk_ratio = args.drunk_ratio.clamp(0.0, 1.0);
    let mut sensors: Vec<SimulatedSensor> = (1..=args.devices)
        .map(|n| {
            SimulatedSensor::new(
                format!("{}{}", args.device_prefix, n),
                &args.topic_prefix,
                rng.gen_bool(drunk_ratio),
            )
        })
        .collect();
    let drunk = sensors.iter().filter(|s| s.is_drunk()).count();
    info!("{} of {} devices start drunk", drunk, sensors.len());

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut published = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, published {} readings", published);
                break;
            }
        }

        for sensor in sensors.iter_mut() {
            let (level, payload) = match sensor.next_payload(&mut rng, drunk_ratio) {
                Ok(next) => next,
                Err(e) => {
                    error!("Failed to encode reading: {}", e);
                    continue;
                }
            };
            match client
                .publish(&sensor.topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                Ok(_) => {
                    published += 1;
                    debug!(device_id = %sensor.device_id, level, "Published");
                }
                Err(e) => warn!(device_id = %sensor.device_id, "Failed to publish: {}", e),
            }
        }

        if published > 0 && published % 1000 < sensors.len() as u64 {
            info!("Published {} readings", published);
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
}
