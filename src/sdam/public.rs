use std::{borrow::Cow, fmt, time::Duration};

pub use crate::sdam::description::{server::ServerType, topology::TopologyType};
use crate::{
    bson::{oid::ObjectId, DateTime},
    options::ServerAddress,
    sdam::{description::server::ServerDescription, TopologyDescription as Description},
    selection_criteria::TagSet,
};

/// A description of the most up-to-date information known about a server, as of its last
/// check.
#[derive(Clone)]
pub struct ServerInfo<'a> {
    pub(crate) description: Cow<'a, ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a server check to round-trip
    /// from the driver to the server.
    ///
    /// This is the value that the driver uses internally to determine the latency window as part
    /// of server selection.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the last time that the driver's monitoring thread for the server updated the
    /// internal information about the server.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.description.last_update_time
    }

    /// Gets the maximum wire version that the server supports.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.description.max_wire_version().ok().flatten()
    }

    /// Gets the minimum wire version that the server supports.
    pub fn min_wire_version(&self) -> Option<i32> {
        self.description.min_wire_version().ok().flatten()
    }

    /// Gets the name of the replica set that the server is part of.
    pub fn replica_set_name(&self) -> Option<String> {
        self.description.set_name().ok().flatten()
    }

    /// Gets the version of the replica set that the server is part of.
    pub fn replica_set_version(&self) -> Option<i32> {
        self.description.set_version().ok().flatten()
    }

    /// Gets the election id reported by the server, if it is a replica set member.
    pub fn election_id(&self) -> Option<ObjectId> {
        self.description.election_id().ok().flatten()
    }

    /// Get the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the tags associated with the server.
    pub fn tags(&self) -> Option<&TagSet> {
        self.description.tags().ok().flatten()
    }

    /// Gets the error the monitor encountered during its last check of the server, if any.
    pub fn error(&self) -> Option<&str> {
        self.description.error()
    }
}

impl fmt::Debug for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::result::Result<(), fmt::Error> {
        match self.description.reply {
            Ok(_) => f
                .debug_struct("Server Description")
                .field("Address", self.address())
                .field("Type", &self.server_type())
                .field("Average RTT", &self.average_round_trip_time())
                .field("Last Update Time", &self.last_update_time())
                .field("Max Wire Version", &self.max_wire_version())
                .field("Min Wire Version", &self.min_wire_version())
                .field("Replica Set Name", &self.replica_set_name())
                .field("Replica Set Version", &self.replica_set_version())
                .field("Tags", &self.tags())
                .finish(),
            Err(ref e) => f
                .debug_struct("Server Description")
                .field("Address", self.address())
                .field("Type", &self.server_type())
                .field("Error", e)
                .finish(),
        }
    }
}

impl fmt::Display for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::result::Result<(), fmt::Error> {
        write!(
            f,
            "{{ Address: {}, Type: {:?}",
            self.address(),
            self.server_type()
        )?;

        match self.description.reply {
            Ok(_) => {
                if let Some(avg_rtt) = self.average_round_trip_time() {
                    write!(f, ", Average RTT: {:?}", avg_rtt)?;
                }

                if let Some(last_update_time) = self.last_update_time() {
                    write!(f, ", Last Update Time: {}", last_update_time)?;
                }

                if let Some(max_wire_version) = self.max_wire_version() {
                    write!(f, ", Max Wire Version: {}", max_wire_version)?;
                }

                if let Some(rs_name) = self.replica_set_name() {
                    write!(f, ", Replica Set Name: {}", rs_name)?;
                }

                if let Some(tags) = self.tags() {
                    write!(f, ", Tags: {:?}", tags)?;
                }
            }
            Err(ref e) => {
                write!(f, ", Error: {}", e)?;
            }
        }

        write!(f, " }}")
    }
}

/// A snapshot of the driver's view of the deployment it is connected to.
#[derive(Clone, Debug)]
pub struct TopologyDescription {
    pub(crate) description: Description,
}

impl From<Description> for TopologyDescription {
    fn from(description: Description) -> Self {
        Self { description }
    }
}

impl TopologyDescription {
    /// The type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.description.topology_type
    }

    /// The replica set name, if the topology is (or was configured to be) a replica set.
    pub fn set_name(&self) -> Option<&str> {
        self.description.set_name.as_deref()
    }

    /// Information about each server in the topology.
    pub fn servers(&self) -> Vec<ServerInfo<'_>> {
        self.description
            .servers
            .values()
            .map(ServerInfo::new_borrowed)
            .collect()
    }

    /// Information about the server at `address`, if it is part of the topology.
    pub fn server(&self, address: &ServerAddress) -> Option<ServerInfo<'_>> {
        self.description
            .servers
            .get(address)
            .map(ServerInfo::new_borrowed)
    }

    /// Whether any server in the topology is currently reachable.
    pub fn has_available_servers(&self) -> bool {
        self.description.has_available_servers()
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.description, f)
    }
}
