use std::time::Duration;

use mqttlink::session::{PublishOnConnect, Session, SessionConfig};
use mqttlink::transport::IoTransport;
use mqttlink::{Protocol, QoS};

#[tokio::main]
async fn main() {
    simple_logger::SimpleLogger::new().init().unwrap();
    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "test.mosquitto.org:1883".to_string());
    let stream = tokio::net::TcpStream::connect(&host).await.unwrap();

    let mut config = SessionConfig::new("mqttlink-publish");
    config.clean_session = true;
    config.set_keep_alive(Duration::from_secs(30));

    let policy = PublishOnConnect::new()
        .message("mqttlink/topic1", "test1", QoS::AtMostOnce)
        .message("mqttlink/topic2", "test2", QoS::AtLeastOnce)
        .message("mqttlink/topic3", "test3", QoS::ExactlyOnce);

    let mut session = Session::new(IoTransport::new(stream), Protocol::V4)
        .with_config(config)
        .with_handler(policy);
    println!("Session result: {:?}", session.run().await);
    println!("Packet ids used: {:?}", session.handler().packet_ids());
}
