use super::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Query parameters, passed to the server untouched.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Routing classification of a unit of work.
///
/// The driver never inspects query text; the caller states whether work reads
/// or writes and the router picks a server accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    #[default]
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => write!(f, "READ"),
            AccessMode::Write => write!(f, "WRITE"),
        }
    }
}

impl FromStr for AccessMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read" | "r" => Ok(AccessMode::Read),
            "write" | "w" => Ok(AccessMode::Write),
            other => Err(DriverError::Configuration(format!(
                "unknown access mode '{other}', expected 'read' or 'write'"
            ))),
        }
    }
}

/// Network location of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub const DEFAULT_PORT: u16 = 7687;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    DriverError::Configuration(format!("invalid port in address '{s}'"))
                })?;
                (host, port)
            }
            None => (s, Self::DEFAULT_PORT),
        };
        if host.trim().is_empty() {
            return Err(DriverError::Configuration(format!(
                "address '{s}' has an empty host"
            )));
        }
        Ok(Self::new(host, port))
    }
}

/// A query text plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    #[serde(default)]
    pub params: Params,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Params::new(),
        }
    }

    pub fn with_params(text: impl Into<String>, params: Params) -> Self {
        Self {
            text: text.into(),
            params,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::new(text)
    }
}

/// One result row, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    values: BTreeMap<String, serde_json::Value>,
}

impl Record {
    pub fn new(values: BTreeMap<String, serde_json::Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn into_values(self) -> BTreeMap<String, serde_json::Value> {
        self.values
    }
}

impl FromIterator<(String, serde_json::Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Records produced by one query, plus where they came from.
#[derive(Debug, Clone)]
pub struct QueryResult {
    records: Vec<Record>,
    server: ServerAddress,
}

impl QueryResult {
    pub fn new(records: Vec<Record>, server: ServerAddress) -> Self {
        Self { records, server }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn row_count(&self) -> usize {
        self.records.len()
    }

    pub fn single(&self) -> Option<&Record> {
        match self.records.as_slice() {
            [record] => Some(record),
            _ => None,
        }
    }

    /// Address of the server that executed the query.
    pub fn server(&self) -> &ServerAddress {
        &self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr: ServerAddress = "db-1.internal:7000".parse().unwrap();
        assert_eq!(addr.host(), "db-1.internal");
        assert_eq!(addr.port(), 7000);
        assert_eq!(addr.to_string(), "db-1.internal:7000");

        let addr: ServerAddress = "localhost".parse().unwrap();
        assert_eq!(addr.port(), ServerAddress::DEFAULT_PORT);

        assert!("host:notaport".parse::<ServerAddress>().is_err());
        assert!(":7687".parse::<ServerAddress>().is_err());
    }

    #[test]
    fn test_parse_access_mode() {
        assert_eq!("READ".parse::<AccessMode>().unwrap(), AccessMode::Read);
        assert_eq!("w".parse::<AccessMode>().unwrap(), AccessMode::Write);
        assert!("both".parse::<AccessMode>().is_err());
    }

    #[test]
    fn test_query_builder() {
        let query = Query::new("PUT").param("key", "a").param("value", 1);
        assert_eq!(query.params.get("key"), Some(&serde_json::json!("a")));
        assert_eq!(query.params.len(), 2);
    }
}
