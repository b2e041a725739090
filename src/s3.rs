use crate::errors::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Object storage credentials, as handed over by the storage integration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCredentials {
    pub bucket_name: String,
    /// `host:port`, without scheme.
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: Option<String>,
    pub insecure: bool,
}

impl StorageCredentials {
    /// Parse the storage integration's plain key/value data.
    ///
    /// A scheme on the endpoint is stripped; `http://` marks the connection insecure.
    pub fn from_databag(data: &BTreeMap<String, String>) -> Result<Self> {
        let field = |key: &'static str| -> Result<String> {
            match data.get(key).map(|v| v.trim()) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => bail!(ErrorKind::MissingStorageField(key)),
            }
        };
        let (endpoint, insecure) = split_scheme(&field("endpoint")?);
        Ok(StorageCredentials {
            bucket_name: field("bucket")?,
            endpoint,
            access_key_id: field("access-key")?,
            secret_access_key: field("secret-key")?,
            region: data.get("region").filter(|r| !r.is_empty()).cloned(),
            insecure,
        })
    }

    /// Fail on any required field left empty.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("bucket", &self.bucket_name),
            ("endpoint", &self.endpoint),
            ("access-key", &self.access_key_id),
            ("secret-key", &self.secret_access_key),
        ] {
            ensure!(!value.is_empty(), ErrorKind::MissingStorageField(name));
        }
        Ok(())
    }
}

fn split_scheme(endpoint: &str) -> (String, bool) {
    if let Some(rest) = endpoint.strip_prefix("http://") {
        (rest.to_string(), true)
    } else if let Some(rest) = endpoint.strip_prefix("https://") {
        (rest.to_string(), false)
    } else {
        (endpoint.to_string(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn databag(endpoint: &str) -> BTreeMap<String, String> {
        btreemap! {
            "access-key".to_string() => "key".to_string(),
            "bucket".to_string() => "pyroscope".to_string(),
            "endpoint".to_string() => endpoint.to_string(),
            "secret-key".to_string() => "soverysecret".to_string(),
        }
    }

    #[test]
    fn http_endpoint_is_insecure() {
        let creds = StorageCredentials::from_databag(&databag("http://1.2.3.4:9000")).unwrap();
        assert_eq!(creds.endpoint, "1.2.3.4:9000");
        assert!(creds.insecure);
        assert_eq!(creds.bucket_name, "pyroscope");
        assert_eq!(creds.access_key_id, "key");
        assert_eq!(creds.secret_access_key, "soverysecret");
        assert_eq!(creds.region, None);
    }

    #[test]
    fn bare_and_https_endpoints_are_secure() {
        let creds = StorageCredentials::from_databag(&databag("1.2.3.4:9000")).unwrap();
        assert_eq!(creds.endpoint, "1.2.3.4:9000");
        assert!(!creds.insecure);
        let creds = StorageCredentials::from_databag(&databag("https://s3.example.com")).unwrap();
        assert_eq!(creds.endpoint, "s3.example.com");
        assert!(!creds.insecure);
    }

    #[test]
    fn missing_fields_fail() {
        let mut data = databag("1.2.3.4:9000");
        data.remove("secret-key");
        let err = StorageCredentials::from_databag(&data).unwrap_err();
        match err.kind() {
            ErrorKind::MissingStorageField(field) => assert_eq!(*field, "secret-key"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn empty_fields_fail_validation() {
        let mut creds = StorageCredentials::from_databag(&databag("1.2.3.4:9000")).unwrap();
        assert!(creds.validate().is_ok());
        creds.bucket_name.clear();
        assert!(creds.validate().is_err());
    }
}
