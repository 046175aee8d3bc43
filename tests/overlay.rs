use std::time::Duration;

use deadline::deadline;
use supernode::{
    message::{
        JoinOk, JoinSuperPeerOk, JoinSuperPeerStatus, MessageKind, Status, SuperPeerSearchOk,
        UnregisterOk,
    },
    transport::{MemoryNetwork, NetworkHandler},
    AttachmentState, Context, Liveness, RoutingStrategy,
};

mod common;
#[allow(unused_imports)]
use crate::common::{
    addr, config, enable_tracing, is_attached_to, is_neighbor, is_super_peer, localhost_with_port,
    start_node, start_node_with, BootstrapServer, Recorder,
};

const TIMEOUT: Duration = Duration::from_secs(2);
const STRATEGY: RoutingStrategy = RoutingStrategy::SuperPeerFlooding;

fn is_assigned_to(super_peer: &Context, node: &Context) -> bool {
    super_peer
        .router()
        .routing_table()
        .as_super_peer()
        .is_some_and(|table| table.ordinary_peers().contains(addr(node)))
}

fn is_in_backbone(super_peer: &Context, node: &Context) -> bool {
    super_peer
        .router()
        .routing_table()
        .as_super_peer()
        .is_some_and(|table| table.super_peers().contains(addr(node)))
}

fn aggregated_count(super_peer: &Context, name: &str) -> usize {
    super_peer
        .router()
        .resources()
        .aggregated()
        .and_then(|index| index.aggregated_resource(name))
        .map_or(0, |resource| resource.node_count())
}

/// Starts a super-peer.
fn start_super_peer(network: &MemoryNetwork, max_assigned: usize) -> Context {
    let mut config = config(0, STRATEGY);
    config.max_assigned_ordinary_peer_count = max_assigned;

    let node = start_node(network, config);
    node.router().promote_to_super_peer();
    node
}

#[tokio::test(flavor = "multi_thread")]
async fn join_and_leave() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, config(0, STRATEGY));
    let b = start_node(&network, config(0, STRATEGY));

    a.overlay().join(addr(&b));

    let (a_clone, b_clone) = (a.clone(), b.clone());
    deadline!(TIMEOUT, move || is_neighbor(&a_clone, &b_clone)
        && is_neighbor(&b_clone, &a_clone));

    a.overlay().leave();

    let (a_clone, b_clone) = (a.clone(), b.clone());
    deadline!(TIMEOUT, move || a_clone.router().routing_table().all().is_empty()
        && b_clone.router().routing_table().all().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn join_refused_at_capacity() {
    let network = MemoryNetwork::new();
    let mut b_config = config(0, STRATEGY);
    b_config.max_unstructured_peer_count = 1;

    let a = start_node(&network, config(0, STRATEGY));
    let b = start_node(&network, b_config);
    let c = start_node(&network, config(0, STRATEGY));
    let recorder = Recorder::attach(&c);

    a.overlay().join(addr(&b));
    let (a_clone, b_clone) = (a.clone(), b.clone());
    deadline!(TIMEOUT, move || is_neighbor(&a_clone, &b_clone));

    c.overlay().join(addr(&b));
    let recorder_clone = recorder.clone();
    deadline!(TIMEOUT, move || !recorder_clone
        .received_of(MessageKind::JoinOk)
        .is_empty());

    let join_ok = JoinOk::try_from(&recorder.received_of(MessageKind::JoinOk)[0]).unwrap();
    assert_eq!(join_ok.status, Status::Failure);
    assert!(!is_neighbor(&b, &c));
    assert!(!is_neighbor(&c, &b));
    assert_eq!(b.router().routing_table().unstructured().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn join_hint_attaches_to_super_peer() {
    let network = MemoryNetwork::new();
    let super_peer = start_super_peer(&network, 10);
    let node = start_node_with(&network, config(0, STRATEGY), &["Cars"]);

    node.overlay().join(addr(&super_peer));

    let (node_clone, sp_clone) = (node.clone(), super_peer.clone());
    deadline!(TIMEOUT, move || is_attached_to(&node_clone, &sp_clone)
        && aggregated_count(&sp_clone, "Cars") == 1);

    assert_eq!(node.overlay().attachment_state(), AttachmentState::Attached);
    assert!(is_neighbor(&node, &super_peer));
    assert!(is_assigned_to(&super_peer, &node));
}

#[tokio::test(flavor = "multi_thread")]
async fn full_super_peer_offers_alternate() {
    let network = MemoryNetwork::new();
    let s1 = start_super_peer(&network, 1);
    let s2 = start_super_peer(&network, 1);

    s2.overlay().join_super_peer(addr(&s1));
    let (s1_clone, s2_clone) = (s1.clone(), s2.clone());
    deadline!(TIMEOUT, move || is_in_backbone(&s1_clone, &s2_clone)
        && is_in_backbone(&s2_clone, &s1_clone));

    let o1 = start_node(&network, config(0, STRATEGY));
    o1.overlay().join_super_peer(addr(&s1));
    let (o1_clone, s1_clone) = (o1.clone(), s1.clone());
    deadline!(TIMEOUT, move || is_attached_to(&o1_clone, &s1_clone));

    let o2 = start_node(&network, config(0, STRATEGY));
    let recorder = Recorder::attach(&o2);
    o2.overlay().join_super_peer(addr(&s1));

    let (o2_clone, s2_clone, recorder_clone) = (o2.clone(), s2.clone(), recorder.clone());
    deadline!(TIMEOUT, move || is_attached_to(&o2_clone, &s2_clone)
        && recorder_clone.received_of(MessageKind::JoinSuperPeerOk).len() == 2);

    // Replies may reach the recorder out of order.
    let replies: Vec<JoinSuperPeerStatus> = recorder
        .received_of(MessageKind::JoinSuperPeerOk)
        .iter()
        .map(|message| JoinSuperPeerOk::try_from(message).unwrap().status)
        .collect();
    assert!(replies.contains(&JoinSuperPeerStatus::Full(addr(&s2))));
    assert!(replies.contains(&JoinSuperPeerStatus::Admitted));
    assert_eq!(o2.overlay().attachment_state(), AttachmentState::Attached);
    assert!(!is_assigned_to(&s1, &o2));
}

#[tokio::test(flavor = "multi_thread")]
async fn full_super_peer_without_alternate() {
    let network = MemoryNetwork::new();
    let s1 = start_super_peer(&network, 1);

    let o1 = start_node(&network, config(0, STRATEGY));
    o1.overlay().join_super_peer(addr(&s1));
    let (o1_clone, s1_clone) = (o1.clone(), s1.clone());
    deadline!(TIMEOUT, move || is_attached_to(&o1_clone, &s1_clone));

    // Turned down without an alternate, the node promotes itself and joins the backbone.
    let o2 = start_node(&network, config(0, STRATEGY));
    o2.overlay().join_super_peer(addr(&s1));

    let (o2_clone, s1_clone) = (o2.clone(), s1.clone());
    deadline!(TIMEOUT, move || is_in_backbone(&s1_clone, &o2_clone)
        && is_in_backbone(&o2_clone, &s1_clone));

    assert!(is_super_peer(&o2));
    assert_eq!(
        o2.overlay().attachment_state(),
        AttachmentState::SelfPromoted
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn lone_node_promotes_itself() {
    let network = MemoryNetwork::new();
    let node = start_node(&network, config(0, STRATEGY));

    assert!(node.overlay().search_for_super_peer());
    assert!(!node.overlay().search_for_super_peer());
    assert_eq!(node.overlay().attachment_state(), AttachmentState::Searching);

    let node_clone = node.clone();
    deadline!(TIMEOUT, move || is_super_peer(&node_clone));

    assert_eq!(
        node.overlay().attachment_state(),
        AttachmentState::SelfPromoted
    );
    assert!(!node.overlay().search_for_super_peer());
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_super_peer_is_given_up() {
    let network = MemoryNetwork::new();
    let node = start_node(&network, config(0, STRATEGY));

    // Reachable, but never answers a join.
    let silent = network.handler(localhost_with_port(0)).unwrap();
    silent.start_listening().unwrap();

    assert!(node.overlay().search_for_super_peer());
    silent.send_message(
        addr(&node),
        SuperPeerSearchOk {
            super_peer: Some(silent.local_addr()),
        }
        .into(),
    );

    let node_clone = node.clone();
    deadline!(TIMEOUT, move || is_super_peer(&node_clone));

    assert_eq!(
        node.overlay().attachment_state(),
        AttachmentState::SelfPromoted
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn super_peer_found_through_neighbor() {
    let network = MemoryNetwork::new();
    let super_peer = start_super_peer(&network, 10);
    let neighbor = start_node(&network, config(0, STRATEGY));
    let node = start_node(&network, config(0, STRATEGY));

    // Neither knows a super-peer yet, so the join carries no hint.
    node.overlay().join(addr(&neighbor));
    let (node_clone, neighbor_clone) = (node.clone(), neighbor.clone());
    deadline!(TIMEOUT, move || is_neighbor(&node_clone, &neighbor_clone));

    neighbor.overlay().join_super_peer(addr(&super_peer));
    let (neighbor_clone, sp_clone) = (neighbor.clone(), super_peer.clone());
    deadline!(TIMEOUT, move || is_attached_to(&neighbor_clone, &sp_clone));

    assert!(node.overlay().search_for_super_peer());

    let (node_clone, sp_clone) = (node.clone(), super_peer.clone());
    deadline!(TIMEOUT, move || is_attached_to(&node_clone, &sp_clone));

    assert_eq!(node.overlay().attachment_state(), AttachmentState::Attached);
    assert!(is_assigned_to(&super_peer, &node));

    // The search timer must not promote an attached node.
    tokio::time::sleep(node.config().ser_super_peer_timeout * 4).await;
    assert!(!is_super_peer(&node));
}

#[tokio::test(flavor = "multi_thread")]
async fn super_peer_leaving_triggers_search() {
    let network = MemoryNetwork::new();
    let super_peer = start_super_peer(&network, 10);
    let node = start_node(&network, config(0, STRATEGY));

    node.overlay().join_super_peer(addr(&super_peer));
    let (node_clone, sp_clone) = (node.clone(), super_peer.clone());
    deadline!(TIMEOUT, move || is_attached_to(&node_clone, &sp_clone));

    super_peer.overlay().leave();

    let (node_clone, sp_clone) = (node.clone(), super_peer.clone());
    deadline!(TIMEOUT, move || is_super_peer(&node_clone)
        && !is_assigned_to(&sp_clone, &node_clone));

    assert_eq!(
        node.overlay().attachment_state(),
        AttachmentState::SelfPromoted
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn gossip_refreshes_aggregated_listing() {
    let network = MemoryNetwork::new();
    let super_peer = start_super_peer(&network, 10);
    let node = start_node_with(&network, config(0, STRATEGY), &["Cars"]);

    node.overlay().join_super_peer(addr(&super_peer));
    let sp_clone = super_peer.clone();
    deadline!(TIMEOUT, move || aggregated_count(&sp_clone, "Cars") == 1);

    {
        let resources = node.router().resources();
        resources.owned().remove_resource("Cars");
        resources.owned().add_resource("Up", "/shared/Up");
    }
    super_peer.overlay().gossip();

    let sp_clone = super_peer.clone();
    deadline!(TIMEOUT, move || aggregated_count(&sp_clone, "Up") == 1
        && aggregated_count(&sp_clone, "Cars") == 0);

    // An inactive assigned peer is dropped along with its listing.
    super_peer
        .router()
        .routing_table()
        .get(addr(&node))
        .unwrap()
        .set_liveness(Liveness::Inactive);
    super_peer.overlay().gossip();

    assert!(!is_assigned_to(&super_peer, &node));
    assert_eq!(aggregated_count(&super_peer, "Up"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn gossip_loop_starts_and_stops() {
    let network = MemoryNetwork::new();
    let mut config = config(0, STRATEGY);
    config.gossiping_enabled = true;

    // An unattached ordinary peer's gossip starts a search, which ends in self-promotion.
    let node = start_node(&network, config);
    assert!(node.overlay().is_gossiping_enabled());
    assert!(!node.overlay().enable_gossiping());

    let node_clone = node.clone();
    deadline!(TIMEOUT, move || is_super_peer(&node_clone));

    node.shutdown();
    assert!(!node.overlay().is_gossiping_enabled());
    assert!(!node.router().is_listening());
}

#[tokio::test(flavor = "multi_thread")]
async fn register_through_bootstrap_server() {
    let network = MemoryNetwork::new();
    let server = BootstrapServer::start(&network, 4000);

    let start_registered = |names: &[&str]| {
        let mut config = config(0, STRATEGY);
        config.bootstrap_server = Some(server.addr());
        let node = start_node_with(&network, config, names);
        assert!(node.overlay().register());
        node
    };

    // The first node finds nobody and becomes the super-peer.
    let a = start_registered(&[]);
    let a_clone = a.clone();
    deadline!(TIMEOUT, move || is_super_peer(&a_clone));

    let b = start_registered(&["Up"]);
    let c = start_registered(&[]);

    let (a_clone, b_clone, c_clone) = (a.clone(), b.clone(), c.clone());
    deadline!(TIMEOUT, move || is_attached_to(&b_clone, &a_clone)
        && is_attached_to(&c_clone, &a_clone)
        && aggregated_count(&a_clone, "Up") == 1);

    assert!(is_assigned_to(&a, &b));
    assert!(is_assigned_to(&a, &c));
    assert_eq!(server.registered().len(), 3);

    let recorder = Recorder::attach(&c);
    assert!(c.overlay().unregister());

    let recorder_clone = recorder.clone();
    deadline!(TIMEOUT, move || !recorder_clone
        .received_of(MessageKind::UnregisterOk)
        .is_empty());

    let unregister_ok =
        UnregisterOk::try_from(&recorder.received_of(MessageKind::UnregisterOk)[0]).unwrap();
    assert_eq!(unregister_ok.status, Status::Success);
    assert_eq!(server.registered().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn register_without_bootstrap_server() {
    let network = MemoryNetwork::new();
    let node = start_node(&network, config(0, STRATEGY));

    assert!(!node.overlay().register());
    assert!(!node.overlay().unregister());
}
