//! Connection settings shared by every client the facade opens: brokers, client id,
//! SASL credentials and TLS.

use std::str::FromStr;

use rdkafka::ClientConfig;
use tracing::warn;

use crate::config::KafkaConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramMechanism {
    Sha256,
    Sha512,
}

impl ScramMechanism {
    pub fn sasl_mechanism(self) -> &'static str {
        match self {
            ScramMechanism::Sha256 => "SCRAM-SHA-256",
            ScramMechanism::Sha512 => "SCRAM-SHA-512",
        }
    }
}

impl FromStr for ScramMechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHA256" => Ok(ScramMechanism::Sha256),
            "SHA512" => Ok(ScramMechanism::Sha512),
            other => Err(other.to_string()),
        }
    }
}

/// Build the base client config for `client_id`. Fails only when a configured CA bundle
/// can't be read.
pub fn client_config(config: &KafkaConfig, client_id: &str) -> Result<ClientConfig, ConfigError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("client.id", client_id);

    let username = config.sasl_username();
    let protocol = match (username.is_some(), config.kafka_tls) {
        (false, false) => "plaintext",
        (false, true) => "ssl",
        (true, false) => "sasl_plaintext",
        (true, true) => "sasl_ssl",
    };
    client_config.set("security.protocol", protocol);

    // Checked even without credentials so a misspelt mechanism is reported
    let mechanism = sasl_mechanism(config);
    if let Some(username) = username {
        client_config
            .set("sasl.username", username)
            .set(
                "sasl.password",
                config.kafka_sasl_password.as_deref().unwrap_or_default(),
            )
            .set("sasl.mechanism", mechanism);
    }

    if config.kafka_tls {
        if config.kafka_tls_skip_verify {
            warn!("TLS certificate verification is disabled for kafka connections");
        }
        client_config.set(
            "enable.ssl.certificate.verification",
            (!config.kafka_tls_skip_verify).to_string(),
        );

        if let Some(path) = config
            .kafka_tls_root_ca_path
            .as_deref()
            .filter(|path| !path.is_empty())
        {
            let pem = std::fs::read_to_string(path).map_err(|source| ConfigError::CaFile {
                path: path.to_string(),
                source,
            })?;
            client_config.set("ssl.ca.pem", pem);
        }
    }

    Ok(client_config)
}

fn sasl_mechanism(config: &KafkaConfig) -> &'static str {
    match config.kafka_scram_mechanism.as_deref() {
        None | Some("") => "PLAIN",
        Some(name) => match name.parse::<ScramMechanism>() {
            Ok(mechanism) => mechanism.sasl_mechanism(),
            Err(unknown) => {
                warn!(
                    mechanism = %unknown,
                    "Undefined scram mechanism, must be `SHA512` or `SHA256`"
                );
                "PLAIN"
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn sasl_config(mechanism: Option<&str>) -> KafkaConfig {
        let mut config = KafkaConfig::with_hosts("broker-1:9092,broker-2:9092");
        config.kafka_sasl_username = Some("user".to_string());
        config.kafka_sasl_password = Some("secret".to_string());
        config.kafka_scram_mechanism = mechanism.map(str::to_string);
        config
    }

    #[test]
    fn plaintext_without_credentials() {
        let config = KafkaConfig::with_hosts("broker:9092");
        let client_config = client_config(&config, "client-1").unwrap();

        assert_eq!(client_config.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(client_config.get("client.id"), Some("client-1"));
        assert_eq!(client_config.get("security.protocol"), Some("plaintext"));
        assert_eq!(client_config.get("sasl.username"), None);
        assert_eq!(client_config.get("sasl.mechanism"), None);
    }

    #[test]
    fn sasl_plain_by_default() {
        let client_config = client_config(&sasl_config(None), "client").unwrap();

        assert_eq!(client_config.get("security.protocol"), Some("sasl_plaintext"));
        assert_eq!(client_config.get("sasl.username"), Some("user"));
        assert_eq!(client_config.get("sasl.password"), Some("secret"));
        assert_eq!(client_config.get("sasl.mechanism"), Some("PLAIN"));
    }

    #[test]
    fn scram_mechanisms() {
        let sha256 = client_config(&sasl_config(Some("SHA256")), "client").unwrap();
        assert_eq!(sha256.get("sasl.mechanism"), Some("SCRAM-SHA-256"));

        let sha512 = client_config(&sasl_config(Some("SHA512")), "client").unwrap();
        assert_eq!(sha512.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
    }

    #[test]
    fn unknown_scram_mechanism_is_not_fatal() {
        let client_config = client_config(&sasl_config(Some("MD5")), "client").unwrap();
        assert_eq!(client_config.get("sasl.mechanism"), Some("PLAIN"));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unknown_scram_mechanism_warns_without_credentials() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let mut config = KafkaConfig::with_hosts("broker:9092");
        config.kafka_scram_mechanism = Some("MD5".to_string());
        let client_config = tracing::subscriber::with_default(subscriber, || {
            client_config(&config, "client").unwrap()
        });

        assert_eq!(client_config.get("security.protocol"), Some("plaintext"));
        assert_eq!(client_config.get("sasl.mechanism"), None);
        let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("Undefined scram mechanism"), "logs: {logs}");
        assert!(logs.contains("MD5"), "logs: {logs}");
    }

    #[test]
    fn tls_verifies_certificates_by_default() {
        let mut config = sasl_config(None);
        config.kafka_tls = true;
        let client_config = client_config(&config, "client").unwrap();

        assert_eq!(client_config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(
            client_config.get("enable.ssl.certificate.verification"),
            Some("true")
        );
        assert_eq!(client_config.get("ssl.ca.pem"), None);
    }

    #[test]
    fn tls_skip_verify_is_opt_in() {
        let mut config = KafkaConfig::with_hosts("broker:9092");
        config.kafka_tls = true;
        config.kafka_tls_skip_verify = true;
        let client_config = client_config(&config, "client").unwrap();

        assert_eq!(client_config.get("security.protocol"), Some("ssl"));
        assert_eq!(
            client_config.get("enable.ssl.certificate.verification"),
            Some("false")
        );
    }

    #[test]
    fn tls_loads_ca_bundle() {
        let mut ca_file = tempfile::NamedTempFile::new().unwrap();
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        ca_file.write_all(pem.as_bytes()).unwrap();

        let mut config = KafkaConfig::with_hosts("broker:9092");
        config.kafka_tls = true;
        config.kafka_tls_root_ca_path = Some(ca_file.path().to_string_lossy().into_owned());
        let client_config = client_config(&config, "client").unwrap();

        assert_eq!(client_config.get("ssl.ca.pem"), Some(pem));
    }

    #[test]
    fn unreadable_ca_bundle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing-ca.pem");

        let mut config = KafkaConfig::with_hosts("broker:9092");
        config.kafka_tls = true;
        config.kafka_tls_root_ca_path = Some(missing.to_string_lossy().into_owned());

        match client_config(&config, "client") {
            Err(ConfigError::CaFile { path, .. }) => {
                assert_eq!(path, missing.to_string_lossy())
            }
            other => panic!("expected CA file error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn ca_path_ignored_without_tls() {
        let mut config = KafkaConfig::with_hosts("broker:9092");
        config.kafka_tls_root_ca_path = Some("/does/not/exist.pem".to_string());
        assert!(client_config(&config, "client").is_ok());
    }
}
