//! The description of a single command sent to a server and how its reply is interpreted.

use crate::{
    bson::{Bson, Document},
    client::options::ClientOptions,
    cmap::{Command, RawCommandResponse},
    concern::WriteConcern,
    error::{Error, ErrorKind, Result, WriteConcernError},
    selection_criteria::SelectionCriteria,
};

/// Whether an operation reads or writes, along with the policy that goes with it.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum OperationKind {
    /// The operation only reads data and may be routed according to `selection_criteria`.
    /// When unset, the client's default criteria are used.
    Read {
        /// Where the operation may be sent.
        selection_criteria: Option<SelectionCriteria>,
    },

    /// The operation modifies data and is always sent to the primary. When unset, the client's
    /// default write concern is used.
    Write {
        /// The acknowledgement requested from the server.
        write_concern: Option<WriteConcern>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

impl Retryability {
    /// Returns this level of retryability in tandem with the client options.
    pub(crate) fn with_options(&self, options: &ClientOptions) -> Self {
        match self {
            Self::Write if options.retry_writes != Some(false) => Self::Write,
            Self::Read if options.retry_reads != Some(false) => Self::Read,
            _ => Self::None,
        }
    }

    /// Whether this level of retryability can retry the given error.
    pub(crate) fn can_retry_error(&self, error: &Error) -> bool {
        match self {
            Self::Write => error.is_write_retryable(),
            Self::Read => error.is_read_retryable(),
            Self::None => false,
        }
    }
}

/// A command to run against a database, executed with
/// [`Client::execute_operation`](crate::Client::execute_operation).
///
/// The command's name is the first key of its body. Operations are retryable by default: a
/// read is retried once after a network or "not primary" error when `retry_reads` is enabled,
/// and an acknowledged write likewise when `retry_writes` is enabled.
///
/// ```rust
/// # use mongodb_core::{bson::doc, Operation, options::WriteConcern};
/// let find = Operation::read("app", doc! { "find": "users", "filter": {} }, None).with_limit(10);
/// let insert = Operation::write(
///     "app",
///     doc! { "insert": "users", "documents": [{ "name": "ada" }] },
///     WriteConcern::majority(),
/// );
/// let ping = Operation::read("admin", doc! { "ping": 1 }, None).retryable(false);
/// ```
#[derive(Clone, Debug)]
pub struct Operation {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) kind: OperationKind,
    pub(crate) retryability: Retryability,
    pub(crate) limit: Option<u64>,
}

impl Operation {
    /// A read against `db`, routed according to `selection_criteria`.
    pub fn read(
        db: impl Into<String>,
        body: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Self {
        Self::new(
            db.into(),
            body,
            OperationKind::Read {
                selection_criteria: selection_criteria.into(),
            },
            Retryability::Read,
        )
    }

    /// A write against `db` on the primary, acknowledged according to `write_concern`.
    pub fn write(
        db: impl Into<String>,
        body: Document,
        write_concern: impl Into<Option<WriteConcern>>,
    ) -> Self {
        Self::new(
            db.into(),
            body,
            OperationKind::Write {
                write_concern: write_concern.into(),
            },
            Retryability::Write,
        )
    }

    fn new(target_db: String, body: Document, kind: OperationKind, retryability: Retryability) -> Self {
        let name = body.keys().next().cloned().unwrap_or_default();
        Self {
            name,
            target_db,
            body,
            kind,
            retryability,
            limit: None,
        }
    }

    /// Sets whether the operation may be retried once after a transient failure.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryability = match (retryable, &self.kind) {
            (false, _) => Retryability::None,
            (true, OperationKind::Read { .. }) => Retryability::Read,
            (true, OperationKind::Write { .. }) => Retryability::Write,
        };
        self
    }

    /// Caps the number of documents returned in the reply's `cursor.firstBatch`.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The name of the command.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The database the command runs against.
    pub fn target_db(&self) -> &str {
        &self.target_db
    }

    /// Whether the operation reads or writes.
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub(crate) fn is_write(&self) -> bool {
        matches!(self.kind, OperationKind::Write { .. })
    }

    pub(crate) fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        match self.kind {
            OperationKind::Read {
                ref selection_criteria,
            } => selection_criteria.as_ref(),
            OperationKind::Write { .. } => None,
        }
    }

    pub(crate) fn write_concern(&self) -> Option<&WriteConcern> {
        match self.kind {
            OperationKind::Write { ref write_concern } => write_concern.as_ref(),
            OperationKind::Read { .. } => None,
        }
    }

    /// Builds the wire command for one attempt, attaching `write_concern` to writes when it is
    /// not the server default.
    pub(crate) fn build(&self, write_concern: Option<&WriteConcern>) -> Result<Command> {
        if self.name.is_empty() {
            return Err(Error::invalid_argument("an operation's command body must not be empty"));
        }

        let mut body = self.body.clone();
        if let Some(write_concern) = write_concern.filter(|_| self.is_write()) {
            write_concern.validate()?;
            if !write_concern.is_empty() {
                body.insert("writeConcern", crate::bson::to_bson(write_concern)?);
            }
        }

        Ok(Command::new(self.name.clone(), self.target_db.clone(), body))
    }

    /// Interprets a reply: `ok: 0` and write concern failures become command errors; anything
    /// else is returned, with `cursor.firstBatch` cut down to the limit if there is one.
    pub(crate) fn handle_response(&self, response: RawCommandResponse) -> Result<Document> {
        response.validate()?;
        let mut reply = response.into_document()?;

        if let Ok(write_concern_error) = reply.get_document("writeConcernError") {
            let write_concern_error: WriteConcernError =
                crate::bson::from_document(write_concern_error.clone())?;
            let labels: Vec<String> = reply
                .get_array("errorLabels")
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(|label| label.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            return Err(ErrorKind::Command(write_concern_error.into_command_error(labels)).into());
        }

        if let Some(limit) = self.limit {
            truncate_first_batch(&mut reply, limit);
        }

        Ok(reply)
    }
}

fn truncate_first_batch(reply: &mut Document, limit: u64) {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    if let Ok(cursor) = reply.get_document_mut("cursor") {
        if let Some(Bson::Array(batch)) = cursor.get_mut("firstBatch") {
            batch.truncate(limit);
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{Operation, Retryability};
    use crate::{
        bson::{doc, Document},
        client::options::ClientOptions,
        cmap::RawCommandResponse,
        concern::WriteConcern,
        error::{ErrorKind, RETRYABLE_WRITE_ERROR},
        options::ServerAddress,
    };

    fn response(document: Document) -> RawCommandResponse {
        RawCommandResponse::with_document_and_address(ServerAddress::default(), document).unwrap()
    }

    #[test]
    fn name_comes_from_first_key() {
        let op = Operation::read("db", doc! { "count": "coll", "query": {} }, None);
        assert_eq!(op.name(), "count");
        assert_eq!(op.target_db(), "db");
        assert_eq!(op.retryability, Retryability::Read);
        assert_eq!(op.retryable(false).retryability, Retryability::None);
    }

    #[test]
    fn empty_body_is_rejected() {
        let error = Operation::read("db", doc! {}, None).build(None).unwrap_err();
        assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn write_concern_is_attached_to_writes_only() {
        let majority = WriteConcern::majority();

        let write = Operation::write("db", doc! { "insert": "coll" }, None);
        let command = write.build(Some(&majority)).unwrap();
        assert_eq!(
            command.body.get_document("writeConcern").unwrap(),
            &doc! { "w": "majority" }
        );

        let read = Operation::read("db", doc! { "find": "coll" }, None);
        let command = read.build(Some(&majority)).unwrap();
        assert!(command.body.get("writeConcern").is_none());

        let command = write.build(Some(&WriteConcern::default())).unwrap();
        assert!(command.body.get("writeConcern").is_none());
    }

    #[test]
    fn retryability_follows_client_options() {
        let mut options = ClientOptions::builder().build();
        assert_eq!(Retryability::Read.with_options(&options), Retryability::Read);
        assert_eq!(Retryability::Write.with_options(&options), Retryability::Write);

        options.retry_writes = Some(false);
        assert_eq!(Retryability::Write.with_options(&options), Retryability::None);
        assert_eq!(Retryability::Read.with_options(&options), Retryability::Read);

        options.retry_reads = Some(false);
        assert_eq!(Retryability::Read.with_options(&options), Retryability::None);
    }

    #[test]
    fn failed_reply_is_command_error() {
        let op = Operation::read("db", doc! { "find": "coll" }, None);
        let error = op
            .handle_response(response(doc! { "ok": 0, "code": 2, "errmsg": "bad value" }))
            .unwrap_err();
        match *error.kind {
            ErrorKind::Command(ref command_error) => assert_eq!(command_error.code, 2),
            ref other => panic!("expected command error, got {:?}", other),
        }
    }

    #[test]
    fn write_concern_error_is_command_error() {
        let op = Operation::write("db", doc! { "insert": "coll" }, None);
        let error = op
            .handle_response(response(doc! {
                "ok": 1,
                "n": 1,
                "writeConcernError": { "code": 91, "codeName": "ShutdownInProgress", "errmsg": "shutting down" },
                "errorLabels": [RETRYABLE_WRITE_ERROR],
            }))
            .unwrap_err();

        assert!(error.is_shutting_down());
        assert!(error.is_write_retryable());
        assert!(error.contains_label(RETRYABLE_WRITE_ERROR));
    }

    #[test]
    fn first_batch_is_truncated_to_limit() {
        let reply = doc! {
            "ok": 1,
            "cursor": { "id": 0_i64, "ns": "db.coll", "firstBatch": [{ "x": 1 }, { "x": 2 }, { "x": 3 }] },
        };

        let limited = Operation::read("db", doc! { "find": "coll" }, None).with_limit(2);
        let document = limited.handle_response(response(reply.clone())).unwrap();
        let batch = document
            .get_document("cursor")
            .unwrap()
            .get_array("firstBatch")
            .unwrap();
        assert_eq!(batch.len(), 2);

        let unlimited = Operation::read("db", doc! { "find": "coll" }, None);
        let document = unlimited.handle_response(response(reply)).unwrap();
        assert_eq!(
            document
                .get_document("cursor")
                .unwrap()
                .get_array("firstBatch")
                .unwrap()
                .len(),
            3
        );
    }
}
