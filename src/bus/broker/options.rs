//! Pure option building and packet mapping for the broker client
//!
//! Translates [`BusConfig`] into MQTT v5 session options (credentials, TLS
//! material, keep-alive) and maps between [`Message`] values and MQTT v5
//! publish packets: the reply subject rides the response-topic property,
//! headers ride user properties, and queue groups become shared-subscription
//! filters.

use crate::config::{BusConfig, TlsConfig};
use crate::error::{BusError, BusResult};
use crate::message::{Headers, Message};
use rumqttc::v5::mqttbytes::v5::{Publish, PublishProperties};
use rumqttc::v5::MqttOptions;
use rumqttc::{TlsConfiguration, Transport};
use std::time::Duration;
use url::Url;

/// Request channel capacity handed to the MQTT client.
pub(crate) const CHANNEL_CAPACITY: usize = 10;

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Build MQTT session options from the client configuration.
pub(crate) fn configure_options(config: &BusConfig) -> BusResult<MqttOptions> {
    let url = Url::parse(&config.url).map_err(|_| BusError::InvalidUrl(config.url.clone()))?;
    let host = url
        .host_str()
        .ok_or_else(|| BusError::InvalidUrl(config.url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let mut options = MqttOptions::new(config.name.clone(), host, port);
    options.set_keep_alive(KEEP_ALIVE);

    if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
        options.set_credentials(user, pass);
    }

    if config.tls.enabled || url.scheme() == "mqtts" {
        options.set_transport(build_tls_transport(&config.tls)?);
    }

    Ok(options)
}

/// Build the TLS transport from configured material. Paths are read eagerly
/// so invalid material fails the connect, not the first reconnect.
fn build_tls_transport(tls: &TlsConfig) -> BusResult<Transport> {
    if !tls.enabled {
        return Ok(Transport::tls_with_default_config());
    }

    let ca = read_tls_file(tls.ca.as_deref(), "tls.ca")?;
    let client_auth = match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => Some((
            read_tls_file(Some(cert), "tls.cert")?,
            read_tls_file(Some(key), "tls.key")?,
        )),
        (None, None) => None,
        _ => {
            return Err(BusError::Connect(
                "tls.cert and tls.key must be provided together".to_string(),
            ))
        }
    };

    Ok(Transport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

fn read_tls_file(path: Option<&str>, what: &str) -> BusResult<Vec<u8>> {
    let path = path.ok_or_else(|| BusError::Connect(format!("{what} is required")))?;
    std::fs::read(path)
        .map_err(|err| BusError::Connect(format!("failed to read {what} at {path}: {err}")))
}

/// Topic filter for a subscription; queue groups map onto MQTT v5 shared
/// subscriptions so the broker load-balances deliveries across members.
pub(crate) fn subscription_filter(subject: &str, group: Option<&str>) -> String {
    match group {
        Some(group) => format!("$share/{group}/{subject}"),
        None => subject.to_string(),
    }
}

/// Map an incoming publish packet to a [`Message`].
pub(crate) fn message_from_publish(publish: &Publish) -> Message {
    let reply = publish
        .properties
        .as_ref()
        .and_then(|props| props.response_topic.clone());
    let headers: Headers = publish
        .properties
        .as_ref()
        .map(|props| props.user_properties.iter().cloned().collect())
        .unwrap_or_default();

    Message {
        subject: String::from_utf8_lossy(&publish.topic).to_string(),
        reply,
        headers,
        payload: publish.payload.clone(),
    }
}

/// Publish properties carrying the reply subject and headers of a message.
pub(crate) fn publish_properties(msg: &Message) -> PublishProperties {
    PublishProperties {
        response_topic: msg.reply.clone(),
        user_properties: msg
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::QoS;

    fn test_config() -> BusConfig {
        BusConfig::new("mqtt://localhost:1883", "unit-tests")
    }

    #[test]
    fn test_configure_options() {
        let options = configure_options(&test_config());
        assert!(options.is_ok());
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_config();
        config.url = "not a url".to_string();
        assert!(matches!(
            configure_options(&config),
            Err(BusError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_missing_tls_material_fails_connect() {
        let mut config = test_config();
        config.url = "mqtts://broker.internal:8883".to_string();
        config.tls.enabled = true;
        config.tls.ca = Some("/nonexistent/ca.pem".to_string());

        assert!(matches!(
            configure_options(&config),
            Err(BusError::Connect(_))
        ));
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let mut tls = TlsConfig {
            enabled: true,
            cert: Some("/tmp/client.pem".to_string()),
            key: None,
            ca: None,
        };
        // CA missing reports first; give it one that exists.
        let ca_file = tempfile::NamedTempFile::new().unwrap();
        tls.ca = Some(ca_file.path().to_string_lossy().to_string());

        assert!(matches!(
            build_tls_transport(&tls),
            Err(BusError::Connect(_))
        ));
    }

    #[test]
    fn test_subscription_filter_building() {
        assert_eq!(subscription_filter("math.add", None), "math.add");
        assert_eq!(
            subscription_filter("math.add", Some("workers")),
            "$share/workers/math.add"
        );
    }

    #[test]
    fn test_message_from_publish_maps_properties() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("math.add"),
            pkid: 1,
            payload: Bytes::from("{\"a\":2,\"b\":3}"),
            properties: Some(PublishProperties {
                response_topic: Some("_INBOX.reply".to_string()),
                user_properties: vec![("X-Request-Id".to_string(), "42".to_string())],
                ..Default::default()
            }),
        };

        let msg = message_from_publish(&publish);
        assert_eq!(msg.subject, "math.add");
        assert_eq!(msg.reply.as_deref(), Some("_INBOX.reply"));
        assert_eq!(msg.header("X-Request-Id"), Some("42"));
        assert_eq!(&msg.payload[..], b"{\"a\":2,\"b\":3}");
    }

    #[test]
    fn test_message_without_properties() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("events"),
            pkid: 2,
            payload: Bytes::from("x"),
            properties: None,
        };

        let msg = message_from_publish(&publish);
        assert_eq!(msg.reply, None);
        assert!(msg.headers.is_empty());
    }

    #[test]
    fn test_publish_properties_round_trip() {
        let mut msg = Message::with_payload("math.add", &b"{}"[..]);
        msg.reply = Some("_INBOX.reply".to_string());
        msg.headers
            .insert("X-Request-Id".to_string(), "42".to_string());

        let props = publish_properties(&msg);
        assert_eq!(props.response_topic.as_deref(), Some("_INBOX.reply"));
        assert_eq!(
            props.user_properties,
            vec![("X-Request-Id".to_string(), "42".to_string())]
        );
    }
}
