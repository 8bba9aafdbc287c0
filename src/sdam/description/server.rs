use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{oid::ObjectId, DateTime},
    error::Error,
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

const DRIVER_MIN_DB_VERSION: &str = "4.0";
const DRIVER_MIN_WIRE_VERSION: i32 = 7;
const DRIVER_MAX_WIRE_VERSION: i32 = 25;

/// Enum representing the possible types of servers that the driver can connect to.
#[derive(
    Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// A description of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
pub(crate) struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The average duration of this server's hello calls.
    pub(crate) average_round_trip_time: Option<Duration>,

    // A server description either holds the reply to its last check, the error message from a
    // failed check, or neither if it has not been checked yet. Storing a Result of an Option
    // keeps those three states exclusive while letting the accessors below use `?` on the
    // error case.
    pub(crate) reply: Result<Option<HelloReply>, String>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.command_response);
                let other_response = other_reply.as_ref().map(|r| &r.command_response);

                self_response == other_response
            }
            // Failed checks never compare equal, so each one is published.
            _ => false,
        }
    }
}

impl ServerDescription {
    /// A description of a server that has not been checked yet.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: address.clone(),
            server_type: Default::default(),
            last_update_time: None,
            reply: Ok(None),
            average_round_trip_time: None,
        }
    }

    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());

        description.server_type = reply.command_response.server_type();

        // Unknown servers don't take part in latency calculations.
        if description.server_type.is_available() {
            description.average_round_trip_time = Some(average_rtt);
        }

        // Normalize all instances of hostnames to lowercase.
        let response = &mut reply.command_response;
        for list in [
            &mut response.hosts,
            &mut response.passives,
            &mut response.arbiters,
        ]
        .into_iter()
        .flatten()
        {
            for host in list.iter_mut() {
                *host = host.to_lowercase();
            }
        }
        if let Some(ref mut me) = response.me {
            *me = me.to_lowercase();
        }

        description.reply = Ok(Some(reply));
        description
    }

    /// A description of a server whose last check failed with `error`.
    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.reply = Err(error.to_string());
        description
    }

    /// Whether this server can be selected for operations at all.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let hello_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);

            if hello_min_wire_version > DRIVER_MAX_WIRE_VERSION {
                return Some(format!(
                    "Server at {} requires wire version {}, but this version of the driver only \
                     supports up to {}",
                    self.address, hello_min_wire_version, DRIVER_MAX_WIRE_VERSION,
                ));
            }

            let hello_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);

            if hello_max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this version of the driver \
                     requires at least {} (MongoDB {}).",
                    self.address,
                    hello_max_wire_version,
                    DRIVER_MIN_WIRE_VERSION,
                    DRIVER_MIN_DB_VERSION
                ));
            }
        }

        None
    }

    fn reply(&self) -> Result<Option<&HelloReply>, String> {
        self.reply.as_ref().map(Option::as_ref).map_err(Clone::clone)
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>, String> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.set_name.clone()))
    }

    /// The addresses this server reports as members of its replica set: its hosts, passives and
    /// arbiters. Entries that fail to parse are skipped.
    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>, String> {
        let known_hosts = self
            .reply()?
            .map(|reply| {
                let response = &reply.command_response;
                response
                    .hosts
                    .iter()
                    .flatten()
                    .chain(response.passives.iter().flatten())
                    .chain(response.arbiters.iter().flatten())
                    .filter_map(|host| ServerAddress::parse(host).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(known_hosts)
    }

    /// Whether the server reported a `me` address that differs from the one it was contacted at.
    pub(crate) fn invalid_me(&self) -> Result<bool, String> {
        if let Some(reply) = self.reply()? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(ServerAddress::parse(me).ok().as_ref() != Some(&self.address));
            }
        }

        Ok(false)
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>, String> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.set_version))
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>, String> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.election_id))
    }

    pub(crate) fn min_wire_version(&self) -> Result<Option<i32>, String> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.min_wire_version))
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>, String> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.max_wire_version))
    }

    pub(crate) fn tags(&self) -> Result<Option<&TagSet>, String> {
        Ok(self
            .reply()?
            .and_then(|reply| reply.command_response.tags.as_ref()))
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>, String> {
        Ok(self.reply()?.and_then(|reply| {
            reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date)
        }))
    }

    /// The error message from the last failed check of this server, if there was one.
    pub(crate) fn error(&self) -> Option<&str> {
        self.reply.as_ref().err().map(String::as_str)
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags() {
            Ok(Some(tags)) => tags,
            _ => return tag_set.is_empty(),
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}
