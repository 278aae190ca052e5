// Reload atomicity: rewriting the config keeps an unchanged chain running
// untouched, stops the removed one, and starts the added one.
//
// "Untouched" is observed through the wire: the surviving chain's file
// cache still answers `info` with the entry it learned before the reload;
// a restarted chain would have come back empty.

use std::time::Duration;

use client::PushRequester;
use ferry_protocol::{Message, MessageType};
use ferry_test_utils::{free_port, write_ini, SLOW_JOINER};
use server::{MoveServer, ServerArgs};

fn chain_section(name: &str, dir: &std::path::Path, port: u16, topic: &str) -> String {
    format!(
        "[{name}]\n\
         origin = {}/A-{{num:1d}}.dat\n\
         request_address = 127.0.0.1\n\
         request_port = {port}\n\
         topic = {topic}\n\
         use_polling = true\n\
         watchdog_timeout = 0.1\n\n",
        dir.display()
    )
}

async fn info_count(requester: &PushRequester, topic: &str) -> usize {
    let reply = requester
        .send_and_recv(&Message::empty(topic, MessageType::Info), Duration::from_secs(5))
        .await
        .expect("no info reply");
    assert_eq!(reply.mtype, MessageType::Info);
    reply.data["files"].as_array().map(Vec::len).unwrap_or(0)
}

#[tokio::test]
async fn reload_keeps_unchanged_stops_removed_starts_added() {
    let work = tempfile::tempdir().unwrap();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let dir_c = tempfile::tempdir().unwrap();
    let port_a = free_port();
    let port_c = free_port();

    let config = work.path().join("server.ini");
    write_ini(
        work.path(),
        "server.ini",
        &format!(
            "{}{}",
            chain_section("a", dir_a.path(), port_a, "/a"),
            chain_section("b", dir_b.path(), free_port(), "/b"),
        ),
    );

    let mut srv = MoveServer::new(ServerArgs {
        config_file: config.clone(),
        publish_port: 0,
        disable_backlog: true,
        force_polling: false,
    })
    .await
    .unwrap();
    srv.reload().await.unwrap();
    assert_eq!(srv.chain_names(), vec!["a", "b"]);

    // Teach chain a one file, visible through its cache.
    tokio::time::sleep(SLOW_JOINER).await;
    std::fs::write(dir_a.path().join("A-1.dat"), b"data").unwrap();
    let req_a = PushRequester::new("127.0.0.1", port_a);
    assert!(
        eventually_count(&req_a, "/a", 1, Duration::from_secs(5)).await,
        "chain a never cached the announcement"
    );

    // Rewrite: a byte-identical, b gone, c new.
    write_ini(
        work.path(),
        "server.ini",
        &format!(
            "{}{}",
            chain_section("a", dir_a.path(), port_a, "/a"),
            chain_section("c", dir_c.path(), port_c, "/c"),
        ),
    );
    srv.reload().await.unwrap();
    assert_eq!(srv.chain_names(), vec!["a", "c"]);

    // a kept its state across the reload: same port, same cache content.
    assert_eq!(info_count(&req_a, "/a").await, 1, "chain a was restarted");

    // c is up and accepting requests.
    let req_c = PushRequester::new("127.0.0.1", port_c);
    let pong = req_c
        .send_and_recv(&Message::empty("/c", MessageType::Ping), Duration::from_secs(5))
        .await
        .expect("chain c not accepting requests");
    assert_eq!(pong.mtype, MessageType::Pong);

    srv.shutdown().await;
}

async fn eventually_count(
    requester: &PushRequester,
    topic: &str,
    want: usize,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if info_count(requester, topic).await >= want {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn reload_survives_a_broken_section() {
    let work = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let config = work.path().join("server.ini");
    write_ini(
        work.path(),
        "server.ini",
        &format!(
            "{}[broken]\ntopic = /only-topic\n",
            chain_section("good", dir.path(), free_port(), "/g")
        ),
    );

    let mut srv = MoveServer::new(ServerArgs {
        config_file: config,
        publish_port: 0,
        disable_backlog: true,
        force_polling: false,
    })
    .await
    .unwrap();
    srv.reload().await.unwrap();
    assert_eq!(
        srv.chain_names(),
        vec!["good"],
        "a broken section must be skipped, not fatal"
    );
    srv.shutdown().await;
}
