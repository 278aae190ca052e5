// Mirror interposition: two producers announce the same uid, the mirror
// republishes once under its own request address, and a downstream push
// against the mirror is served via an upstream fetch.

use std::time::Duration;

use ferry_bus::Subscriber;
use ferry_protocol::{Message, MessageType};
use ferry_test_utils::{eventually, recv_timeout, write_ini, SLOW_JOINER};
use serde_json::json;
use server::{MoveServer, ServerArgs};

async fn start_producer(work: &std::path::Path, name: &str, in_dir: &std::path::Path) -> MoveServer {
    let ini = write_ini(
        work,
        &format!("{name}.ini"),
        &format!(
            "[chain]\n\
             origin = {}/H-{{nominal_time:%Y%m%d%H%M}}-__\n\
             request_address = 127.0.0.1\n\
             request_port = 0\n\
             topic = /H\n\
             use_polling = true\n\
             watchdog_timeout = 0.1\n",
            in_dir.display()
        ),
    );
    let mut srv = MoveServer::new(ServerArgs {
        config_file: ini,
        publish_port: 0,
        disable_backlog: true,
        force_polling: false,
    })
    .await
    .unwrap();
    srv.reload().await.unwrap();
    srv
}

#[tokio::test]
async fn mirror_republishes_once_and_proxies_push() {
    let work = tempfile::tempdir().unwrap();
    let in_one = tempfile::tempdir().unwrap();
    let in_two = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let downstream_dir = tempfile::tempdir().unwrap();

    let srv_one = start_producer(work.path(), "one", in_one.path()).await;
    let srv_two = start_producer(work.path(), "two", in_two.path()).await;

    let mirror_ini = write_ini(
        work.path(),
        "mirror.ini",
        &format!(
            "[chain]\n\
             providers = 127.0.0.1:{} 127.0.0.1:{}\n\
             client_topic = /H\n\
             topic = /H-mirror\n\
             request_port = 0\n\
             request_address = 127.0.0.1\n\
             destination = file://{}\n\
             heartbeat = off\n",
            srv_one.publish_port(),
            srv_two.publish_port(),
            cache_dir.path().display()
        ),
    );
    let mut mir = mirror::MoveMirror::new(mirror::MirrorArgs {
        config_file: mirror_ini,
        publish_port: 0,
    })
    .await
    .unwrap();
    mir.reload().await.unwrap();
    let mirror_request_port = mir.chain("chain").unwrap().request_port();

    let mirror_pub = format!("tcp://127.0.0.1:{}", mir.publish_port());
    let mut mirrored = Subscriber::connect(&[mirror_pub], &["/H-mirror".to_owned()])
        .await
        .unwrap();
    tokio::time::sleep(SLOW_JOINER).await;

    // Both producers get the same file.
    std::fs::write(in_one.path().join("H-202401011200-__"), b"data").unwrap();
    std::fs::write(in_two.path().join("H-202401011200-__"), b"data").unwrap();

    // Exactly one mirrored announcement, carrying the mirror's address.
    let announced = recv_timeout(&mut mirrored, Duration::from_secs(5))
        .await
        .expect("mirror republished nothing");
    assert_eq!(announced.mtype, MessageType::File);
    assert_eq!(
        announced.data["request_address"],
        format!("127.0.0.1:{mirror_request_port}")
    );
    let extra = recv_timeout(&mut mirrored, Duration::from_millis(500)).await;
    assert!(extra.is_none(), "second announcement for the same uid");

    // Give the mirror time to register the second source as fallback.
    assert!(
        eventually(
            || mir.chain("chain").unwrap().registry.sources("H-202401011200-__").len() == 2,
            Duration::from_secs(3)
        )
        .await,
        "second source never registered"
    );

    // Downstream push against the mirror.
    let requester = client::PushRequester::new("127.0.0.1", mirror_request_port);
    let mut push_data = announced.data_map();
    push_data.insert(
        "destination".into(),
        json!(format!("file://{}/", downstream_dir.path().display())),
    );
    let push = Message::new(
        &announced.subject,
        MessageType::Push,
        serde_json::Value::Object(push_data),
    );
    let reply = requester
        .send_and_recv(&push, Duration::from_secs(10))
        .await
        .expect("mirror did not reply");
    assert_eq!(reply.mtype, MessageType::File);

    // The file went producer → mirror cache → downstream.
    let delivered = downstream_dir.path().join("H-202401011200-__");
    assert!(delivered.exists(), "downstream copy missing");
    assert_eq!(std::fs::read(&delivered).unwrap(), b"data");
    assert!(
        cache_dir.path().join("H-202401011200-__").exists(),
        "mirror cache copy missing"
    );

    mir.shutdown().await;
    srv_one.shutdown().await;
    srv_two.shutdown().await;
}
