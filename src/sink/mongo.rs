//! Document store speaking the MongoDB wire protocol.

use super::document_store::{AggregateDocument, DocumentStore};
use super::SinkError;
use mongodb::bson::{self, doc, Document};
use mongodb::error::{Error as DriverError, ErrorKind};
use mongodb::options::UpdateOptions;
use mongodb::sync::{Client, Collection};
use std::time::Duration;

const TIMEOUT_OPTIONS: [&str; 2] = ["serverSelectionTimeoutMS", "connectTimeoutMS"];

/// Upserts into `<database>.<collection>` through the official driver.
///
/// The driver connects lazily, so construction never touches the network;
/// an unreachable server surfaces on the first write as [`SinkError::Unavailable`].
pub struct MongoStore {
    collection: Collection<Document>,
    namespace: String,
}

impl MongoStore {
    pub fn connect(
        uri: &str,
        database: &str,
        collection: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, SinkError> {
        let uri = match timeout {
            Some(timeout) => with_timeouts(uri, timeout),
            None => uri.to_string(),
        };
        // The uri may carry credentials; keep it out of errors.
        let client = Client::with_uri_str(&uri)
            .map_err(|err| SinkError::Config(format!("invalid mongodb connection string: {err}")))?;
        Ok(Self {
            collection: client.database(database).collection(collection),
            namespace: format!("{database}.{collection}"),
        })
    }
}

impl DocumentStore for MongoStore {
    fn upsert(&mut self, document: &AggregateDocument) -> Result<(), SinkError> {
        let fields = bson::to_document(&document.fields)
            .map_err(|err| SinkError::Rejected(format!("aggregate encoding failed: {err}")))?;
        let options = UpdateOptions::builder().upsert(true).build();
        self.collection
            .update_one(doc! { "_id": document.id.as_str() }, doc! { "$set": fields }, options)
            .map(|_| ())
            .map_err(classify)
    }

    fn find(&self, id: &str) -> Result<Option<AggregateDocument>, SinkError> {
        let found = self
            .collection
            .find_one(doc! { "_id": id }, None)
            .map_err(classify)?;
        found
            .map(bson::from_document::<AggregateDocument>)
            .transpose()
            .map_err(|err| SinkError::Rejected(format!("stored aggregate is malformed: {err}")))
    }

    fn describe(&self) -> String {
        format!("mongodb {}", self.namespace)
    }
}

fn classify(err: DriverError) -> SinkError {
    match err.kind.as_ref() {
        ErrorKind::Write(_) | ErrorKind::Authentication { .. } | ErrorKind::InvalidArgument { .. } => {
            SinkError::Rejected(err.to_string())
        }
        _ => SinkError::Unavailable(err.to_string()),
    }
}

/// Adds server-selection and connect timeouts unless the uri already sets them.
fn with_timeouts(uri: &str, timeout: Duration) -> String {
    let millis = timeout.as_millis();
    let mut result = uri.to_string();
    for option in TIMEOUT_OPTIONS {
        let present = uri
            .split_once('?')
            .is_some_and(|(_, query)| {
                query
                    .split('&')
                    .any(|pair| pair.split('=').next() == Some(option))
            });
        if present {
            continue;
        }
        let separator = if result.contains('?') {
            "&"
        } else {
            let hosts = result.split_once("://").map_or(result.as_str(), |(_, rest)| rest);
            if hosts.contains('/') {
                "?"
            } else {
                "/?"
            }
        };
        result = format!("{result}{separator}{option}={millis}");
    }
    result
}
