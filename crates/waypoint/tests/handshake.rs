//! Integration tests for the connection handshake
//!
//! Both sides exchange serialized messages, the way they would over a
//! real transport.

use tempfile::tempdir;
use waypoint::handshake::{
    AccessLists, AdmissionPolicy, ClientProfile, ClientState, HandshakeClient, HandshakeHost,
    HandshakeMessage, HostOutcome, HostWorldInfo, IdentityList, KeyedTicketVerifier,
};
use waypoint::{HandshakeError, Platform, PlatformUserId};

const KEY: &[u8] = b"integration-key";

fn world() -> HostWorldInfo {
    HostWorldInfo {
        world_name: "Asgard".to_string(),
        seed: 7,
        seed_name: "Yggdrasil".to_string(),
        world_uid: 123,
        world_gen_version: 2,
        net_time: 0.0,
    }
}

fn host(password: Option<&str>, access: AccessLists) -> HandshakeHost {
    let mut policy = AdmissionPolicy::new("Odin", world());
    policy.password = password.map(str::to_string);
    HandshakeHost::new(policy, access, Box::new(KeyedTicketVerifier::new(KEY)))
}

fn steam(id: &str) -> PlatformUserId {
    PlatformUserId::new(Platform::Steam, id)
}

fn client(identity: &PlatformUserId, name: &str) -> HandshakeClient {
    let ticket = KeyedTicketVerifier::new(KEY).issue(identity);
    HandshakeClient::new(ClientProfile::new(identity.clone(), name, ticket))
}

/// Carries messages both ways as bytes until both sides go quiet.
fn exchange(
    host: &mut HandshakeHost,
    connection: u64,
    client: &mut HandshakeClient,
    first: Vec<HandshakeMessage>,
) -> HostOutcome {
    let mut outcome = HostOutcome::Pending;
    let mut to_host: Vec<Vec<u8>> = first.iter().map(HandshakeMessage::to_bytes).collect();
    while !to_host.is_empty() {
        let mut to_client = Vec::new();
        for bytes in to_host.drain(..) {
            let message = HandshakeMessage::from_bytes(&bytes).unwrap();
            let reply = host.handle(connection, message);
            outcome = reply.outcome;
            to_client.extend(reply.messages.iter().map(HandshakeMessage::to_bytes));
        }
        for bytes in to_client {
            let message = HandshakeMessage::from_bytes(&bytes).unwrap();
            to_host.extend(client.handle(message).iter().map(HandshakeMessage::to_bytes));
        }
    }
    outcome
}

fn join(host: &mut HandshakeHost, connection: u64, client: &mut HandshakeClient, identity: &PlatformUserId) -> HostOutcome {
    host.connect(connection, identity.clone());
    let hello = client.on_connected();
    exchange(host, connection, client, hello)
}

#[test]
fn test_two_players_join_over_the_wire() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("adminlist.txt"), "# admins\nSteam_1\n").unwrap();
    let access = AccessLists::load_dir(dir.path()).unwrap();
    let mut host = host(Some("mead"), access);

    let first = steam("1");
    let mut a = client(&first, "Thor").with_password("mead");
    assert_eq!(join(&mut host, 1, &mut a, &first), HostOutcome::Admitted(first.clone()));

    let second = steam("2");
    let mut b = client(&second, "Loki").with_password("mead");
    assert_eq!(join(&mut host, 2, &mut b, &second), HostOutcome::Admitted(second.clone()));

    let session = b.session().unwrap();
    assert_eq!(session.world.world_name, "Asgard");
    assert_eq!(session.host.display_name, "Odin");
    assert_eq!(session.players, vec!["Loki".to_string(), "Thor".to_string()]);
    assert_eq!(session.admins, vec!["Steam_1".to_string()]);
    assert_eq!(host.peer_count(), 2);
}

#[test]
fn test_banned_player_is_told_banned_even_with_wrong_password() {
    let access = AccessLists {
        banned: IdentityList::parse("Steam_66\n"),
        ..Default::default()
    };
    let mut host = host(Some("mead"), access);
    let banned = steam("66");
    let mut outcast = client(&banned, "Fenrir").with_password("not-it");

    let outcome = join(&mut host, 1, &mut outcast, &banned);
    assert_eq!(outcome, HostOutcome::Rejected(HandshakeError::Banned));
    assert_eq!(outcast.error(), Some(HandshakeError::Banned));
    assert_eq!(host.peer_count(), 0);
}

#[test]
fn test_ban_is_checked_before_a_correct_password() {
    let access = AccessLists {
        banned: IdentityList::parse("Steam_66\n"),
        ..Default::default()
    };
    let mut host = host(Some("mead"), access);

    let banned = steam("66");
    let mut outcast = client(&banned, "Fenrir").with_password("mead");
    assert_eq!(
        join(&mut host, 1, &mut outcast, &banned),
        HostOutcome::Rejected(HandshakeError::Banned)
    );
    assert_eq!(outcast.error(), Some(HandshakeError::Banned));

    // The same password admits anyone not on the ban list.
    let friend = steam("67");
    let mut guest = client(&friend, "Tyr").with_password("mead");
    assert_eq!(join(&mut host, 2, &mut guest, &friend), HostOutcome::Admitted(friend.clone()));
    assert_eq!(host.peer_count(), 1);
}

#[test]
fn test_legacy_ban_entry_matches() {
    let access = AccessLists {
        banned: IdentityList::parse("66\n"),
        ..Default::default()
    };
    let mut host = host(None, access);
    let banned = steam("66");
    let mut outcast = client(&banned, "Fenrir");
    assert_eq!(
        join(&mut host, 1, &mut outcast, &banned),
        HostOutcome::Rejected(HandshakeError::Banned)
    );
}

#[test]
fn test_prompted_password_then_kick() {
    let mut host = host(Some("mead"), AccessLists::default());
    let identity = steam("5");
    let mut player = client(&identity, "Freya");

    assert_eq!(join(&mut host, 9, &mut player, &identity), HostOutcome::Pending);
    assert_eq!(player.state(), &ClientState::AwaitingPassword);

    let answer = player.supply_password("mead");
    assert_eq!(
        exchange(&mut host, 9, &mut player, answer),
        HostOutcome::Admitted(identity.clone())
    );
    assert!(player.is_admitted());

    let (connection, message) = host.kick(&identity).unwrap();
    assert_eq!(connection, 9);
    player.handle(HandshakeMessage::from_bytes(&message.to_bytes()).unwrap());
    assert_eq!(player.error(), Some(HandshakeError::Kicked));
    assert_eq!(host.peer_count(), 0);
}
