mod description;
mod monitor;
pub mod public;
mod server;
#[cfg(test)]
mod test;
mod topology;

pub use self::public::{ServerInfo, ServerType, TopologyType};

pub(crate) use self::{
    description::{
        server::ServerDescription,
        topology::{server_selection::SelectedServer, TopologyDescription},
    },
    monitor::{DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    server::Server,
    topology::{HandshakePhase, Topology, TopologyUpdater, DEFAULT_SERVER_SELECTION_TIMEOUT},
};
