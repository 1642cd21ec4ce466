//! MQTT over WebSocket on top of `rumqttc`
//!
//! Each `open` builds a fresh `AsyncClient`/`EventLoop` pair and spawns a pump
//! task that polls the event loop and forwards CONNACK, PUBLISH, errors and
//! close to the session's [`EventSink`]. The pump stops polling after the
//! first connection error, which is what keeps rumqttc from reconnecting on
//! its own.

use super::error::TransportError;
use super::transport::{BrokerClient, BrokerConnector, ConnectOptions, EventSink, TransportEvent};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Splits the port out of a `ws://host:port[/path]` endpoint.
pub fn endpoint_port(endpoint: &str) -> Result<u16, TransportError> {
    let rest = endpoint
        .strip_prefix("ws://")
        .ok_or_else(|| TransportError::InvalidEndpoint(format!("{} is not a ws:// URI", endpoint)))?;
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(TransportError::InvalidEndpoint(format!(
            "{} has no host",
            endpoint
        )));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.ends_with(':') => port
            .parse()
            .map_err(|_| TransportError::InvalidEndpoint(format!("bad port in {}", endpoint))),
        _ => Ok(80),
    }
}

/// Connector for the plain `ws://` transport
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl BrokerConnector for WsConnector {
    fn open(
        &self,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<Box<dyn BrokerClient>, TransportError> {
        let port = endpoint_port(&options.endpoint)?;

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), options.endpoint.clone(), port);
        mqtt_options
            .set_transport(Transport::Ws)
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, options.request_capacity);
        info!(
            "Opening WebSocket transport to {} as {}",
            options.endpoint, options.client_id
        );
        let pump = tokio::spawn(pump_events(eventloop, sink));

        Ok(Box::new(WsClient { client, pump }))
    }
}

async fn pump_events(mut eventloop: EventLoop, sink: EventSink) {
    let mut connected = false;

    loop {
        let keep_going = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    sink.send(TransportEvent::ConnAck)
                } else {
                    sink.send(TransportEvent::ConnectFailed(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                    false
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => sink.send(TransportEvent::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            }),
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                if suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    sink.send(TransportEvent::Error(format!(
                        "broker rejected subscription (pkid {})",
                        suback.pkid
                    )))
                } else {
                    debug!("SUBACK for pkid {}", suback.pkid);
                    true
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                sink.send(TransportEvent::Closed);
                false
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT flushed to broker");
                sink.send(TransportEvent::Closed);
                false
            }
            Ok(_) => true,
            Err(e) => {
                if connected {
                    warn!("MQTT connection error: {}", e);
                    sink.send(TransportEvent::Error(e.to_string()));
                    sink.send(TransportEvent::Closed);
                } else {
                    sink.send(TransportEvent::ConnectFailed(e.to_string()));
                }
                false
            }
        };

        if !keep_going {
            break;
        }
    }
    debug!("Event pump finished (epoch {})", sink.epoch());
}

struct WsClient {
    client: AsyncClient,
    pump: JoinHandle<()>,
}

impl BrokerClient for WsClient {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn close(&self) -> Result<(), TransportError> {
        self.client
            .try_disconnect()
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn abort(&self) {
        self.pump.abort();
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_is_taken_from_authority() {
        assert_eq!(endpoint_port("ws://10.2.216.208:9001"), Ok(9001));
        assert_eq!(endpoint_port("ws://broker.local:9001/mqtt"), Ok(9001));
        assert_eq!(endpoint_port("ws://broker.local/mqtt"), Ok(80));
    }

    #[test]
    fn non_ws_endpoints_are_rejected() {
        assert!(matches!(
            endpoint_port("mqtt://broker:1883"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            endpoint_port("ws://"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            endpoint_port("ws://broker:notaport"),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }
}
