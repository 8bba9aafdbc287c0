use std::{collections::HashMap, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use super::attempt_to_select_server;
use crate::{
    bson::{doc, DateTime, Document},
    error::ErrorKind,
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::topology::{
            test::{address, description_from_hello},
            TopologyDescription,
        },
        Server,
        ServerInfo,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

fn member(
    description: &mut TopologyDescription,
    host: &str,
    primary: bool,
    rtt_ms: u64,
    tags: Document,
) {
    let hello = doc! {
        "ok": 1,
        "minWireVersion": 0,
        "maxWireVersion": 21,
        "isWritablePrimary": primary,
        "secondary": !primary,
        "setName": "rs",
        "hosts": ["a:27017", "b:27017", "c:27017"],
        "tags": tags,
    };
    description
        .update(description_from_hello(
            &address(host),
            hello,
            Duration::from_millis(rtt_ms),
        ))
        .unwrap();
}

/// Adds a member whose last write happened `write_age` ago.
fn member_with_last_write(
    description: &mut TopologyDescription,
    host: &str,
    primary: bool,
    write_age: Duration,
) {
    let last_write_date =
        DateTime::from_millis(DateTime::now().timestamp_millis() - write_age.as_millis() as i64);
    let hello = doc! {
        "ok": 1,
        "minWireVersion": 0,
        "maxWireVersion": 21,
        "isWritablePrimary": primary,
        "secondary": !primary,
        "setName": "rs",
        "hosts": ["a:27017", "b:27017", "c:27017"],
        "lastWrite": { "lastWriteDate": last_write_date },
    };
    description
        .update(description_from_hello(
            &address(host),
            hello,
            Duration::from_millis(5),
        ))
        .unwrap();
}

fn seeded_with_a() -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(vec![address("a:27017")])
        .build();
    TopologyDescription::new(&options)
}

/// A replica set with a primary at `a` and secondaries at `b` (east) and `c` (west).
fn replica_set() -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(vec![address("a:27017")])
        .build();
    let mut description = TopologyDescription::new(&options);
    member(&mut description, "a:27017", true, 5, doc! {});
    member(&mut description, "b:27017", false, 5, doc! { "dc": "east" });
    member(&mut description, "c:27017", false, 8, doc! { "dc": "west" });
    description
}

fn selected_addresses(
    description: &TopologyDescription,
    criteria: &SelectionCriteria,
) -> Vec<String> {
    let mut addresses: Vec<_> = description
        .suitable_servers_in_latency_window(criteria)
        .unwrap()
        .into_iter()
        .map(|sd| sd.address.to_string())
        .collect();
    addresses.sort();
    addresses
}

fn read_pref(read_pref: ReadPreference) -> SelectionCriteria {
    SelectionCriteria::ReadPreference(read_pref)
}

fn tag_set(key: &str, value: &str) -> TagSet {
    let mut tags = HashMap::new();
    tags.insert(key.to_string(), value.to_string());
    tags
}

#[test]
fn primary_read_selects_primary() {
    let description = replica_set();
    assert_eq!(
        selected_addresses(&description, &read_pref(ReadPreference::Primary)),
        vec!["a:27017"]
    );
}

#[test]
fn secondary_read_selects_secondaries() {
    let description = replica_set();
    assert_eq!(
        selected_addresses(
            &description,
            &read_pref(ReadPreference::Secondary { options: None })
        ),
        vec!["b:27017", "c:27017"]
    );
}

#[test]
fn matching_tag_set_narrows_candidates() {
    let description = replica_set();
    let criteria = read_pref(
        ReadPreference::Secondary { options: None }
            .with_tags(vec![tag_set("dc", "west")])
            .unwrap(),
    );
    assert_eq!(selected_addresses(&description, &criteria), vec!["c:27017"]);
}

#[test]
fn first_matching_tag_set_wins() {
    let description = replica_set();
    let criteria = read_pref(
        ReadPreference::Nearest { options: None }
            .with_tags(vec![tag_set("dc", "north"), tag_set("dc", "east")])
            .unwrap(),
    );
    assert_eq!(selected_addresses(&description, &criteria), vec!["b:27017"]);
}

#[test]
fn unmatched_tag_sets_fall_back_to_all_candidates() {
    let description = replica_set();
    let criteria = read_pref(
        ReadPreference::Secondary { options: None }
            .with_tags(vec![tag_set("dc", "mars")])
            .unwrap(),
    );
    assert_eq!(
        selected_addresses(&description, &criteria),
        vec!["b:27017", "c:27017"]
    );
}

#[test]
fn secondary_preferred_falls_back_to_primary() {
    let options = ClientOptions::builder()
        .hosts(vec![address("a:27017")])
        .build();
    let mut description = TopologyDescription::new(&options);
    member(&mut description, "a:27017", true, 5, doc! {});

    assert_eq!(
        selected_addresses(
            &description,
            &read_pref(ReadPreference::SecondaryPreferred { options: None })
        ),
        vec!["a:27017"]
    );
}

#[test]
fn servers_outside_latency_window_are_excluded() {
    let options = ClientOptions::builder()
        .hosts(vec![address("a:27017")])
        .build();
    let mut description = TopologyDescription::new(&options);
    member(&mut description, "a:27017", true, 5, doc! {});
    member(&mut description, "b:27017", false, 10, doc! {});
    member(&mut description, "c:27017", false, 100, doc! {});

    assert_eq!(
        selected_addresses(
            &description,
            &read_pref(ReadPreference::Nearest { options: None })
        ),
        vec!["a:27017", "b:27017"]
    );
}

#[test]
fn unknown_topology_has_no_suitable_servers() {
    let options = ClientOptions::builder()
        .hosts(vec![address("a:27017")])
        .build();
    let description = TopologyDescription::new(&options);

    assert!(selected_addresses(&description, &read_pref(ReadPreference::Primary)).is_empty());
    assert!(description
        .server_selection_timeout_error_message(&read_pref(ReadPreference::Primary))
        .contains("No available servers"));
}

#[test]
fn max_staleness_below_minimum_is_an_error() {
    let description = replica_set();
    let criteria = read_pref(
        ReadPreference::Secondary { options: None }
            .with_max_staleness(Duration::from_secs(30))
            .unwrap(),
    );

    let error = description
        .suitable_servers_in_latency_window(&criteria)
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}

#[test]
fn predicate_applies_to_data_bearing_servers() {
    let description = replica_set();
    let criteria = SelectionCriteria::Predicate(Arc::new(|info: &ServerInfo| {
        info.address().host() != "b"
    }));
    assert_eq!(
        selected_addresses(&description, &criteria),
        vec!["a:27017", "c:27017"]
    );
}

#[test]
fn compatibility_error_fails_selection() {
    let options = ClientOptions::builder()
        .hosts(vec![address("a:27017")])
        .build();
    let mut description = TopologyDescription::new(&options);
    description
        .update(description_from_hello(
            &address("a:27017"),
            doc! { "ok": 1, "isWritablePrimary": true, "minWireVersion": 0, "maxWireVersion": 3 },
            Duration::from_millis(1),
        ))
        .unwrap();

    let error = description
        .suitable_servers_in_latency_window(&read_pref(ReadPreference::Primary))
        .unwrap_err();
    assert!(error.is_server_selection_error());
}

#[tokio::test]
async fn less_busy_server_is_preferred() {
    let options = ClientOptions::builder()
        .hosts(vec![address("a:27017")])
        .build();
    let mut description = TopologyDescription::new(&options);
    member(&mut description, "a:27017", true, 5, doc! {});
    member(&mut description, "b:27017", false, 5, doc! {});

    let servers: HashMap<ServerAddress, Arc<Server>> = [("a:27017", 10), ("b:27017", 0)]
        .into_iter()
        .map(|(host, count)| {
            let address = address(host);
            (address.clone(), Arc::new(Server::new_mocked(address, count)))
        })
        .collect();

    let criteria = read_pref(ReadPreference::Nearest { options: None });
    for _ in 0..10 {
        let selected = attempt_to_select_server(&criteria, &description, &servers)
            .unwrap()
            .unwrap();
        assert_eq!(selected.address(), &address("b:27017"));
    }
}

#[tokio::test]
async fn selection_tracks_operation_count() {
    let options = ClientOptions::builder()
        .hosts(vec![address("a:27017")])
        .build();
    let mut description = TopologyDescription::new(&options);
    member(&mut description, "a:27017", true, 5, doc! {});

    let server = Arc::new(Server::new_mocked(address("a:27017"), 0));
    let mut servers = HashMap::new();
    servers.insert(address("a:27017"), server.clone());

    let selected = attempt_to_select_server(
        &read_pref(ReadPreference::Primary),
        &description,
        &servers,
    )
    .unwrap()
    .unwrap();
    assert_eq!(server.operation_count(), 1);

    drop(selected);
    assert_eq!(server.operation_count(), 0);
}

#[test]
fn stale_secondary_is_excluded_with_primary() {
    let mut description = seeded_with_a();
    member_with_last_write(&mut description, "a:27017", true, Duration::ZERO);
    member_with_last_write(&mut description, "b:27017", false, Duration::from_secs(1));
    member_with_last_write(&mut description, "c:27017", false, Duration::from_secs(200));
    assert_eq!(
        description.topology_type,
        crate::sdam::TopologyType::ReplicaSetWithPrimary
    );

    let criteria = read_pref(
        ReadPreference::Secondary { options: None }
            .with_max_staleness(Duration::from_secs(100))
            .unwrap(),
    );
    assert_eq!(selected_addresses(&description, &criteria), vec!["b:27017"]);

    // Without a staleness bound both secondaries qualify.
    assert_eq!(
        selected_addresses(
            &description,
            &read_pref(ReadPreference::Secondary { options: None })
        ),
        vec!["b:27017", "c:27017"]
    );
}

#[test]
fn stale_secondary_is_excluded_without_primary() {
    let mut description = seeded_with_a();
    member_with_last_write(&mut description, "b:27017", false, Duration::from_secs(1));
    member_with_last_write(&mut description, "c:27017", false, Duration::from_secs(200));
    assert_eq!(
        description.topology_type,
        crate::sdam::TopologyType::ReplicaSetNoPrimary
    );

    let criteria = read_pref(
        ReadPreference::Nearest { options: None }
            .with_max_staleness(Duration::from_secs(100))
            .unwrap(),
    );
    assert_eq!(selected_addresses(&description, &criteria), vec!["b:27017"]);
}

#[test]
fn primary_preferred_uses_primary_when_known() {
    let description = replica_set();
    let criteria = read_pref(ReadPreference::PrimaryPreferred { options: None });
    assert_eq!(selected_addresses(&description, &criteria), vec!["a:27017"]);
}

#[test]
fn primary_preferred_falls_back_to_secondaries() {
    let mut description = seeded_with_a();
    member(&mut description, "b:27017", false, 5, doc! { "dc": "east" });
    member(&mut description, "c:27017", false, 8, doc! { "dc": "west" });

    let criteria = read_pref(ReadPreference::PrimaryPreferred { options: None });
    assert_eq!(
        selected_addresses(&description, &criteria),
        vec!["b:27017", "c:27017"]
    );

    let criteria = read_pref(
        ReadPreference::PrimaryPreferred { options: None }
            .with_tags(vec![tag_set("dc", "west")])
            .unwrap(),
    );
    assert_eq!(selected_addresses(&description, &criteria), vec!["c:27017"]);
}
