use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode as ConnectReturnCodeV5, Packet as PacketV5,
    SubscribeReasonCode as SubscribeReasonCodeV5,
};
use rumqttc::v5::mqttbytes::QoS as QoSV5;
use rumqttc::v5::{
    AsyncClient as AsyncClientV5, ConnectionError as ConnectionErrorV5, Event as EventV5,
    EventLoop as EventLoopV5, MqttOptions as MqttOptionsV5, StateError as StateErrorV5,
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    StateError, SubscribeReasonCode, Transport,
};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::broker::{BrokerSession, BrokerUrl, ConnectParams, Connector, InboundMessage, ProtocolVersion};
use crate::errors::BrokerError;
use crate::model::ProtocolVariant;

const REQUEST_CAPACITY: usize = 10;
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// [`Connector`] speaking MQTT through `rumqttc`.
#[derive(Debug, Default, Clone)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        MqttConnector
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn BrokerSession>, BrokerError> {
        debug!(
            url = %params.url,
            client_id = %params.client_id,
            version = %params.version,
            "Connecting to broker"
        );

        match params.version {
            ProtocolVersion::V311 => {
                let session = timeout(params.connect_timeout, V4Session::connect(params))
                    .await
                    .map_err(|_| connect_timeout(params))??;
                Ok(Box::new(session))
            }
            ProtocolVersion::V5 => {
                let session = timeout(params.connect_timeout, V5Session::connect(params))
                    .await
                    .map_err(|_| connect_timeout(params))??;
                Ok(Box::new(session))
            }
            ProtocolVersion::V31 => Err(BrokerError::Protocol(
                "MQTT 3.1 is not supported by this client".to_string(),
            )),
        }
    }
}

fn connect_timeout(params: &ConnectParams) -> BrokerError {
    BrokerError::Timeout(format!(
        "no CONNACK from {} within {}s",
        params.url,
        params.connect_timeout.as_secs()
    ))
}

fn transport(url: &BrokerUrl) -> Transport {
    match url.variant {
        ProtocolVariant::Mqtt => Transport::tcp(),
        ProtocolVariant::Mqtts => Transport::tls_with_default_config(),
        ProtocolVariant::Ws => Transport::Ws,
        ProtocolVariant::Wss => Transport::wss_with_default_config(),
    }
}

/// rumqttc expects the full URL as the host for websocket transports.
fn broker_host(url: &BrokerUrl) -> String {
    if url.is_websocket() {
        url.to_string()
    } else {
        url.host.clone()
    }
}

/// Maps socket errors. `None` means the peer closed the connection.
fn classify_io(err: &std::io::Error) -> Option<BrokerError> {
    match err.kind() {
        ErrorKind::ConnectionAborted => None,
        ErrorKind::TimedOut
        | ErrorKind::ConnectionReset
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => Some(BrokerError::Timeout(err.to_string())),
        _ => Some(BrokerError::Other(err.to_string())),
    }
}

fn classify_message(message: String) -> BrokerError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        BrokerError::Timeout(message)
    } else {
        BrokerError::Other(message)
    }
}

fn classify_v4(err: ConnectionError) -> Option<BrokerError> {
    match err {
        ConnectionError::ConnectionRefused(ConnectReturnCode::RefusedProtocolVersion) => Some(
            BrokerError::Protocol("broker refused protocol version".to_string()),
        ),
        ConnectionError::ConnectionRefused(code) => {
            Some(BrokerError::Other(format!("connection refused: {:?}", code)))
        }
        ConnectionError::NotConnAck(packet) => Some(BrokerError::Protocol(format!(
            "expected CONNACK, got {:?}",
            packet
        ))),
        ConnectionError::MqttState(StateError::Deserialization(e)) => {
            Some(BrokerError::Protocol(e.to_string()))
        }
        ConnectionError::MqttState(StateError::AwaitPingResp) => Some(BrokerError::Timeout(
            "keep-alive expired waiting for PINGRESP".to_string(),
        )),
        ConnectionError::Io(e) => classify_io(&e),
        other => Some(classify_message(other.to_string())),
    }
}

fn classify_v5(err: ConnectionErrorV5) -> Option<BrokerError> {
    match err {
        ConnectionErrorV5::ConnectionRefused(
            code @ (ConnectReturnCodeV5::UnsupportedProtocolVersion
            | ConnectReturnCodeV5::MalformedPacket
            | ConnectReturnCodeV5::ProtocolError),
        ) => Some(BrokerError::Protocol(format!("connection refused: {:?}", code))),
        ConnectionErrorV5::ConnectionRefused(code) => {
            Some(BrokerError::Other(format!("connection refused: {:?}", code)))
        }
        ConnectionErrorV5::NotConnAck(packet) => Some(BrokerError::Protocol(format!(
            "expected CONNACK, got {:?}",
            packet
        ))),
        ConnectionErrorV5::MqttState(StateErrorV5::Deserialization(e)) => {
            Some(BrokerError::Protocol(e.to_string()))
        }
        ConnectionErrorV5::MqttState(StateErrorV5::AwaitPingResp) => Some(BrokerError::Timeout(
            "keep-alive expired waiting for PINGRESP".to_string(),
        )),
        ConnectionErrorV5::Io(e) => classify_io(&e),
        other => Some(classify_message(other.to_string())),
    }
}

fn closed_before(what: &str) -> BrokerError {
    BrokerError::Other(format!("connection closed before {}", what))
}

struct V4Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl V4Session {
    async fn connect(params: &ConnectParams) -> Result<Self, BrokerError> {
        let mut options =
            MqttOptions::new(params.client_id.clone(), broker_host(&params.url), params.url.port);
        options.set_keep_alive(params.keep_alive);
        options.set_clean_session(true);
        options.set_transport(transport(&params.url));
        if let Some(credentials) = &params.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => continue,
                Err(e) => return Err(classify_v4(e).unwrap_or_else(|| closed_before("CONNACK"))),
            }
        }

        Ok(V4Session { client, eventloop })
    }
}

#[async_trait]
impl BrokerSession for V4Session {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?;

        let wait = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        return if ack
                            .return_codes
                            .iter()
                            .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
                        {
                            Ok(())
                        } else {
                            Err(BrokerError::Other(format!("subscription to {} rejected", topic)))
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(classify_v4(e).unwrap_or_else(|| closed_before("SUBACK"))),
                }
            }
        };
        timeout(SUBACK_TIMEOUT, wait)
            .await
            .map_err(|_| BrokerError::Timeout(format!("no SUBACK for {}", topic)))?
    }

    async fn next_message(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(InboundMessage::new(publish.topic, publish.payload.to_vec())));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => return Ok(None),
                Ok(_) => continue,
                Err(e) => return classify_v4(e).map_or(Ok(None), Err),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to queue DISCONNECT: {}", e);
            return;
        }
        let _ = timeout(CLOSE_GRACE, self.eventloop.poll()).await;
    }
}

struct V5Session {
    client: AsyncClientV5,
    eventloop: EventLoopV5,
}

impl V5Session {
    async fn connect(params: &ConnectParams) -> Result<Self, BrokerError> {
        let mut options = MqttOptionsV5::new(
            params.client_id.clone(),
            broker_host(&params.url),
            params.url.port,
        );
        options.set_keep_alive(params.keep_alive);
        options.set_clean_start(true);
        options.set_transport(transport(&params.url));
        if let Some(credentials) = &params.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        let (client, mut eventloop) = AsyncClientV5::new(options, REQUEST_CAPACITY);
        loop {
            match eventloop.poll().await {
                Ok(EventV5::Incoming(PacketV5::ConnAck(_))) => break,
                Ok(_) => continue,
                Err(e) => return Err(classify_v5(e).unwrap_or_else(|| closed_before("CONNACK"))),
            }
        }

        Ok(V5Session { client, eventloop })
    }
}

#[async_trait]
impl BrokerSession for V5Session {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.client
            .subscribe(topic, QoSV5::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::Other(e.to_string()))?;

        let wait = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(EventV5::Incoming(PacketV5::SubAck(ack))) => {
                        return if ack
                            .return_codes
                            .iter()
                            .all(|code| matches!(code, SubscribeReasonCodeV5::Success(_)))
                        {
                            Ok(())
                        } else {
                            Err(BrokerError::Other(format!("subscription to {} rejected", topic)))
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(classify_v5(e).unwrap_or_else(|| closed_before("SUBACK"))),
                }
            }
        };
        timeout(SUBACK_TIMEOUT, wait)
            .await
            .map_err(|_| BrokerError::Timeout(format!("no SUBACK for {}", topic)))?
    }

    async fn next_message(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        loop {
            match self.eventloop.poll().await {
                Ok(EventV5::Incoming(PacketV5::Publish(publish))) => {
                    let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                    return Ok(Some(InboundMessage::new(topic, publish.payload.to_vec())));
                }
                Ok(EventV5::Incoming(PacketV5::Disconnect(_))) => return Ok(None),
                Ok(_) => continue,
                Err(e) => return classify_v5(e).map_or(Ok(None), Err),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to queue DISCONNECT: {}", e);
            return;
        }
        let _ = timeout(CLOSE_GRACE, self.eventloop.poll()).await;
    }
}
