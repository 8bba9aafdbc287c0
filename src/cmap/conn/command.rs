use serde::de::DeserializeOwned;

use super::wire::Message;
use crate::{
    bson::{Document, RawBsonRef, RawDocument, RawDocumentBuf},
    error::{CommandError, Error, ErrorKind, Result},
    hello::{HelloCommandResponse, HelloReply},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// Driver-side model of a database command.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) read_pref: Option<ReadPreference>,
    pub(crate) exhaust_allowed: bool,
}

impl Command {
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            read_pref: None,
            exhaust_allowed: false,
        }
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.read_pref = Some(read_preference);
    }

    /// The full document sent over the wire: the body plus `$db` and, if set, `$readPreference`.
    pub(crate) fn into_document(self) -> Result<Document> {
        let mut document = self.body;
        document.insert("$db", self.target_db);
        if let Some(read_pref) = self.read_pref {
            document.insert("$readPreference", read_pref.to_document()?);
        }
        Ok(document)
    }
}

/// A server reply, kept in raw form until the caller decides how to interpret it.
#[derive(Clone, Debug)]
pub(crate) struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    raw: RawDocumentBuf,
}

impl RawCommandResponse {
    #[cfg(test)]
    pub(crate) fn with_document_and_address(source: ServerAddress, doc: Document) -> Result<Self> {
        let raw = crate::bson::to_raw_document_buf(&doc)?;
        Ok(Self { source, raw })
    }

    pub(crate) fn new(source: ServerAddress, message: Message) -> Self {
        Self {
            source,
            raw: message.document_payload,
        }
    }

    /// Whether the reply reports `ok: 1`.
    pub(crate) fn is_success(&self) -> bool {
        match self.raw.get("ok") {
            Ok(Some(RawBsonRef::Int32(i))) => i == 1,
            Ok(Some(RawBsonRef::Int64(i))) => i == 1,
            Ok(Some(RawBsonRef::Double(d))) => d == 1.0,
            Ok(Some(RawBsonRef::Boolean(b))) => b,
            _ => false,
        }
    }

    /// Returns a `Command` error if the reply reports `ok: 0`.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }

        let command_error: CommandError = self.body().map_err(|_| {
            Error::invalid_response(format!(
                "server at {} returned a failure without error details",
                self.source
            ))
        })?;
        Err(Error::new(
            ErrorKind::Command(command_error),
            Option::<Vec<String>>::None,
        ))
    }

    /// Deserialize the body of the response.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        crate::bson::from_slice(self.raw.as_bytes()).map_err(|e| {
            Error::invalid_response(format!("could not deserialize the reply: {}", e))
        })
    }

    pub(crate) fn into_document(self) -> Result<Document> {
        Ok(self.raw.to_document()?)
    }

    /// The address of the server that sent this response.
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }

    pub(crate) fn into_hello_reply(self) -> Result<HelloReply> {
        self.validate()?;
        let command_response: HelloCommandResponse = self.body()?;
        Ok(HelloReply {
            server_address: self.source.clone(),
            command_response,
            raw_command_response: self.into_document()?,
        })
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{Command, RawCommandResponse};
    use crate::{
        bson::doc,
        error::ErrorKind,
        options::ServerAddress,
        selection_criteria::ReadPreference,
    };

    #[test]
    fn command_document_includes_db_and_read_preference() {
        let mut command = Command::new("find", "test", doc! { "find": "coll" });
        command.set_read_preference(ReadPreference::Nearest { options: None });

        assert_eq!(
            command.into_document().unwrap(),
            doc! {
                "find": "coll",
                "$db": "test",
                "$readPreference": { "mode": "nearest" },
            }
        );
    }

    #[test]
    fn failure_reply_becomes_command_error() {
        let response = RawCommandResponse::with_document_and_address(
            ServerAddress::default(),
            doc! {
                "ok": 0.0,
                "code": 10107,
                "codeName": "NotWritablePrimary",
                "errmsg": "not primary",
                "errorLabels": ["RetryableWriteError"],
            },
        )
        .unwrap();

        assert!(!response.is_success());
        let error = response.validate().unwrap_err();
        match *error.kind {
            ErrorKind::Command(ref command_error) => {
                assert_eq!(command_error.code, 10107);
                assert_eq!(command_error.message, "not primary");
            }
            ref other => panic!("expected command error, got {:?}", other),
        }
        assert!(error.contains_label("RetryableWriteError"));
        assert!(error.is_not_primary());
    }

    #[test]
    fn ok_values_of_any_numeric_type() {
        for ok in [doc! { "ok": 1 }, doc! { "ok": 1i64 }, doc! { "ok": 1.0 }] {
            let response =
                RawCommandResponse::with_document_and_address(ServerAddress::default(), ok)
                    .unwrap();
            assert!(response.is_success());
            assert!(response.validate().is_ok());
        }
    }
}
