//! Live push delivery tests
//!
//! The push rules are the heart of the server: a message is pushed to a
//! recipient only while their session's chat mode points at the sender (or
//! the group), and every push rides the recipient's own connection without
//! tearing frames. These tests run two or three real client connections
//! against one server and watch both sides of each exchange.

mod common;

use common::{login_user, start_server, Conn};
use parley_shared::kv_get;
use std::time::Duration;

#[tokio::test]
async fn test_pm_pushed_to_partner_in_chat_mode() {
    let server = start_server().await;
    let mut alice = Conn::connect(&server).await;
    let mut bob = Conn::connect(&server).await;
    let ta = login_user(&mut alice, "alice", "secret1").await;
    let tb = login_user(&mut bob, "bob", "secret2").await;

    let (kind, _, rest) = alice
        .roundtrip(&format!("PM_CHAT_START 20 token={ta} with=bob"))
        .await;
    assert_eq!(kind, "OK");
    assert_eq!(rest, "with=bob me=alice history=empty");

    let (kind, _, rest) = bob
        .roundtrip(&format!("PM_CHAT_START 21 token={tb} with=alice"))
        .await;
    assert_eq!(kind, "OK");
    assert_eq!(kv_get(&rest, "me"), Some("bob"));

    let (kind, _, rest) = alice
        .roundtrip(&format!("PM_SEND 22 token={ta} to=bob content=aGk="))
        .await;
    assert_eq!(kind, "OK");
    assert_eq!(kv_get(&rest, "msg_id"), Some("1"));
    assert_eq!(kv_get(&rest, "status"), Some("sent"));

    // bob is viewing the conversation, so the message arrives as a push
    let push = bob.expect_push("PM").await;
    assert_eq!(kv_get(&push, "from"), Some("alice"));
    assert_eq!(kv_get(&push, "content"), Some("aGk="));
    assert_eq!(kv_get(&push, "msg_id"), Some("1"));
    assert!(kv_get(&push, "ts").unwrap().parse::<i64>().unwrap() > 0);
}

#[tokio::test]
async fn test_pm_not_pushed_outside_chat_mode() {
    let server = start_server().await;
    let mut alice = Conn::connect(&server).await;
    let mut bob = Conn::connect(&server).await;
    let ta = login_user(&mut alice, "alice", "secret1").await;
    let tb = login_user(&mut bob, "bob", "secret2").await;

    // bob is online but not viewing the conversation
    let (kind, _, _) = alice
        .roundtrip(&format!("PM_SEND 30 token={ta} to=bob content=aGk="))
        .await;
    assert_eq!(kind, "OK");

    // nothing arrives on bob's socket: he is not in chat mode
    bob.expect_silence(Duration::from_millis(200)).await;

    // the message is waiting as unread instead
    let (_, _, rest) = bob
        .roundtrip(&format!("PM_CONVERSATIONS 32 token={tb}"))
        .await;
    assert_eq!(rest, "conversations=alice:1");

    // and PM_CHAT_START hands it over and clears the unread count
    let (_, _, rest) = bob
        .roundtrip(&format!("PM_CHAT_START 33 token={tb} with=alice"))
        .await;
    let history = kv_get(&rest, "history").unwrap();
    assert!(history.contains(":aGk=:"), "got: {history}");
    let (_, _, rest) = bob
        .roundtrip(&format!("PM_CONVERSATIONS 34 token={tb}"))
        .await;
    assert_eq!(rest, "conversations=alice:0");
}

#[tokio::test]
async fn test_pm_chat_end_stops_pushes() {
    let server = start_server().await;
    let mut alice = Conn::connect(&server).await;
    let mut bob = Conn::connect(&server).await;
    let ta = login_user(&mut alice, "alice", "secret1").await;
    let tb = login_user(&mut bob, "bob", "secret2").await;

    bob.roundtrip(&format!("PM_CHAT_START 40 token={tb} with=alice"))
        .await;
    let (kind, _, _) = bob.roundtrip(&format!("PM_CHAT_END 41 token={tb}")).await;
    assert_eq!(kind, "OK");

    alice
        .roundtrip(&format!("PM_SEND 42 token={ta} to=bob content=aGk="))
        .await;
    bob.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_pm_history_between_pair() {
    let server = start_server().await;
    let mut alice = Conn::connect(&server).await;
    let mut bob = Conn::connect(&server).await;
    let ta = login_user(&mut alice, "alice", "secret1").await;
    let tb = login_user(&mut bob, "bob", "secret2").await;

    alice
        .roundtrip(&format!("PM_SEND 50 token={ta} to=bob content=Zmlyc3Q="))
        .await;
    bob.roundtrip(&format!("PM_SEND 51 token={tb} to=alice content=c2Vjb25k"))
        .await;

    let (_, _, rest) = alice
        .roundtrip(&format!("PM_HISTORY 52 token={ta} with=bob limit=10"))
        .await;
    assert_eq!(kv_get(&rest, "with"), Some("bob"));
    let messages = kv_get(&rest, "messages").unwrap();
    let entries: Vec<&str> = messages.split(',').collect();
    assert_eq!(entries.len(), 2);
    // most recent first, Base64 padding intact
    assert!(entries[0].contains(":bob:c2Vjb25k:"), "got: {messages}");
    assert!(entries[1].contains(":alice:Zmlyc3Q=:"), "got: {messages}");
}

#[tokio::test]
async fn test_pm_send_errors() {
    let server = start_server().await;
    let mut alice = Conn::connect(&server).await;
    let ta = login_user(&mut alice, "alice", "secret1").await;

    let (_, _, rest) = alice
        .roundtrip(&format!("PM_SEND 60 token={ta} to=alice content=aGk="))
        .await;
    assert!(rest.starts_with("422 cannot_send_to_self"), "got: {rest}");

    let (_, _, rest) = alice
        .roundtrip(&format!("PM_SEND 61 token={ta} to=ghost content=aGk="))
        .await;
    assert!(rest.starts_with("404 user_not_found"), "got: {rest}");

    let (_, _, rest) = alice
        .roundtrip(&format!("PM_SEND 62 token={ta} to=ghost"))
        .await;
    assert!(rest.starts_with("400 missing_fields"), "got: {rest}");
}

#[tokio::test]
async fn test_gm_fan_out_to_group_chat_members() {
    let server = start_server().await;
    let mut alice = Conn::connect(&server).await;
    let mut bob = Conn::connect(&server).await;
    let mut carol = Conn::connect(&server).await;
    let ta = login_user(&mut alice, "alice", "secret1").await;
    let tb = login_user(&mut bob, "bob", "secret2").await;
    let tc = login_user(&mut carol, "carol", "secret3").await;

    let (_, _, rest) = alice
        .roundtrip(&format!("GROUP_CREATE 70 token={ta} name=study"))
        .await;
    let gid = kv_get(&rest, "group_id").unwrap().to_string();
    alice
        .roundtrip(&format!("GROUP_ADD 71 token={ta} group_id={gid} username=bob"))
        .await;
    alice
        .roundtrip(&format!("GROUP_ADD 72 token={ta} group_id={gid} username=carol"))
        .await;

    // bob and carol enter the group chat; alice stays out of chat mode
    let (kind, _, rest) = bob
        .roundtrip(&format!("GM_CHAT_START 73 token={tb} group_id={gid}"))
        .await;
    assert_eq!(kind, "OK");
    assert_eq!(kv_get(&rest, "group_name"), Some("study"));
    assert_eq!(kv_get(&rest, "history"), Some("empty"));
    let (kind, _, _) = carol
        .roundtrip(&format!("GM_CHAT_START 74 token={tc} group_id={gid}"))
        .await;
    assert_eq!(kind, "OK");

    let (kind, _, rest) = alice
        .roundtrip(&format!("GM_SEND 75 token={ta} group_id={gid} content=aGVsbG8="))
        .await;
    assert_eq!(kind, "OK");
    let msg_id = kv_get(&rest, "msg_id").unwrap().to_string();

    for viewer in [&mut bob, &mut carol] {
        let push = viewer.expect_push("GM").await;
        assert_eq!(kv_get(&push, "from"), Some("alice"));
        assert_eq!(kv_get(&push, "group_id"), Some(gid.as_str()));
        assert_eq!(kv_get(&push, "content"), Some("aGVsbG8="));
        assert_eq!(kv_get(&push, "msg_id"), Some(msg_id.as_str()));
    }

    // the sender does not receive their own fan-out
    alice.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_gm_membership_gates() {
    let server = start_server().await;
    let mut alice = Conn::connect(&server).await;
    let mut mallory = Conn::connect(&server).await;
    let ta = login_user(&mut alice, "alice", "secret1").await;
    let tm = login_user(&mut mallory, "mallory", "secret9").await;

    let (_, _, rest) = alice
        .roundtrip(&format!("GROUP_CREATE 80 token={ta} name=private"))
        .await;
    let gid = kv_get(&rest, "group_id").unwrap().to_string();

    for line in [
        format!("GM_SEND 81 token={tm} group_id={gid} content=aGk="),
        format!("GM_HISTORY 82 token={tm} group_id={gid}"),
        format!("GM_CHAT_START 83 token={tm} group_id={gid}"),
    ] {
        let (kind, _, rest) = mallory.roundtrip(&line).await;
        assert_eq!(kind, "ERR");
        assert!(rest.starts_with("403 not_group_member"), "got: {rest}");
    }
}

#[tokio::test]
async fn test_gm_join_leave_notifications() {
    let server = start_server().await;
    let mut alice = Conn::connect(&server).await;
    let mut bob = Conn::connect(&server).await;
    let ta = login_user(&mut alice, "alice", "secret1").await;
    let tb = login_user(&mut bob, "bob", "secret2").await;

    let (_, _, rest) = alice
        .roundtrip(&format!("GROUP_CREATE 90 token={ta} name=study"))
        .await;
    let gid = kv_get(&rest, "group_id").unwrap().to_string();
    alice
        .roundtrip(&format!("GROUP_ADD 91 token={ta} group_id={gid} username=bob"))
        .await;

    alice
        .roundtrip(&format!("GM_CHAT_START 92 token={ta} group_id={gid}"))
        .await;

    // bob entering the chat is announced to alice
    bob.roundtrip(&format!("GM_CHAT_START 93 token={tb} group_id={gid}"))
        .await;
    let push = alice.expect_push("GM_JOIN").await;
    assert_eq!(kv_get(&push, "user"), Some("bob"));
    assert_eq!(kv_get(&push, "group_id"), Some(gid.as_str()));

    // and leaving the chat is announced too
    bob.roundtrip(&format!("GM_CHAT_END 94 token={tb}")).await;
    let push = alice.expect_push("GM_LEAVE").await;
    assert_eq!(kv_get(&push, "user"), Some("bob"));
}

#[tokio::test]
async fn test_group_remove_kicks_viewer() {
    let server = start_server().await;
    let mut alice = Conn::connect(&server).await;
    let mut bob = Conn::connect(&server).await;
    let ta = login_user(&mut alice, "alice", "secret1").await;
    let tb = login_user(&mut bob, "bob", "secret2").await;

    let (_, _, rest) = alice
        .roundtrip(&format!("GROUP_CREATE 100 token={ta} name=study"))
        .await;
    let gid = kv_get(&rest, "group_id").unwrap().to_string();
    alice
        .roundtrip(&format!("GROUP_ADD 101 token={ta} group_id={gid} username=bob"))
        .await;
    bob.roundtrip(&format!("GM_CHAT_START 102 token={tb} group_id={gid}"))
        .await;

    let (kind, _, _) = alice
        .roundtrip(&format!("GROUP_REMOVE 103 token={ta} group_id={gid} username=bob"))
        .await;
    assert_eq!(kind, "OK");

    let push = bob.expect_push("GM_KICKED").await;
    assert_eq!(kv_get(&push, "group_id"), Some(gid.as_str()));

    // bob is really out
    let (_, _, rest) = bob
        .roundtrip(&format!("GM_HISTORY 104 token={tb} group_id={gid}"))
        .await;
    assert!(rest.starts_with("403 not_group_member"), "got: {rest}");
}

#[tokio::test]
async fn test_gm_history_members_and_order() {
    let server = start_server().await;
    let mut alice = Conn::connect(&server).await;
    let mut bob = Conn::connect(&server).await;
    let ta = login_user(&mut alice, "alice", "secret1").await;
    let tb = login_user(&mut bob, "bob", "secret2").await;

    let (_, _, rest) = alice
        .roundtrip(&format!("GROUP_CREATE 110 token={ta} name=study"))
        .await;
    let gid = kv_get(&rest, "group_id").unwrap().to_string();
    alice
        .roundtrip(&format!("GROUP_ADD 111 token={ta} group_id={gid} username=bob"))
        .await;

    alice
        .roundtrip(&format!("GM_SEND 112 token={ta} group_id={gid} content=b25l"))
        .await;
    bob.roundtrip(&format!("GM_SEND 113 token={tb} group_id={gid} content=dHdv"))
        .await;

    let (_, _, rest) = bob
        .roundtrip(&format!("GM_HISTORY 114 token={tb} group_id={gid} limit=10"))
        .await;
    assert_eq!(kv_get(&rest, "group_id"), Some(gid.as_str()));
    let messages = kv_get(&rest, "messages").unwrap();
    let entries: Vec<&str> = messages.split(',').collect();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].contains(":bob:dHdv:"), "got: {messages}");
    assert!(entries[1].contains(":alice:b25l:"), "got: {messages}");
}
