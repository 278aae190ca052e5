// Deletion delay over the wire: a source accepted for deletion (push with
// delete on, or a plain ack) survives at least `remove_delay` seconds and
// is gone shortly after.

use std::time::Duration;

use serde_json::json;

use client::PushRequester;
use ferry_protocol::{Message, MessageType};
use ferry_test_utils::{eventually, write_ini};
use server::{MoveServer, ServerArgs};

const REMOVE_DELAY: Duration = Duration::from_millis(600);

async fn start_server(work: &std::path::Path, in_dir: &std::path::Path) -> MoveServer {
    let ini = write_ini(
        work,
        "server.ini",
        &format!(
            "[chain]\n\
             origin = {}/A-{{num:1d}}.dat\n\
             request_address = 127.0.0.1\n\
             request_port = 0\n\
             topic = /A\n\
             delete = true\n\
             remove_delay = {}\n",
            in_dir.display(),
            REMOVE_DELAY.as_secs_f64(),
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
async fn pushed_source_is_removed_no_earlier_than_the_delay() {
    let work = tempfile::tempdir().unwrap();
    let in_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();

    let srv = start_server(work.path(), in_dir.path()).await;
    let port = srv.chain("chain").unwrap().request_port().unwrap();
    let requester = PushRequester::new("127.0.0.1", port);

    let source = in_dir.path().join("A-1.dat");
    std::fs::write(&source, b"data").unwrap();

    let push = Message::new(
        "/A",
        MessageType::Push,
        json!({
            "uid": "A-1.dat",
            "uri": source.display().to_string(),
            "destination": format!("file://{}/", out_dir.path().display()),
        }),
    );
    let reply = requester
        .send_and_recv(&push, Duration::from_secs(5))
        .await
        .expect("no push reply");
    assert_eq!(reply.mtype, MessageType::File);
    assert_eq!(std::fs::read(out_dir.path().join("A-1.dat")).unwrap(), b"data");

    // Within the delay window the source must still be there.
    tokio::time::sleep(REMOVE_DELAY / 3).await;
    assert!(source.exists(), "source removed before the delay elapsed");

    // And it must go away shortly after the deadline.
    assert!(
        eventually(|| !source.exists(), REMOVE_DELAY * 4).await,
        "source never removed"
    );

    srv.shutdown().await;
}

#[tokio::test]
async fn acked_source_is_scheduled_for_removal_too() {
    let work = tempfile::tempdir().unwrap();
    let in_dir = tempfile::tempdir().unwrap();

    let srv = start_server(work.path(), in_dir.path()).await;
    let port = srv.chain("chain").unwrap().request_port().unwrap();
    let requester = PushRequester::new("127.0.0.1", port);

    let source = in_dir.path().join("A-2.dat");
    std::fs::write(&source, b"data").unwrap();

    let ack = Message::new(
        "/A",
        MessageType::Ack,
        json!({"uid": "A-2.dat", "uri": source.display().to_string()}),
    );
    let reply = requester
        .send_and_recv(&ack, Duration::from_secs(5))
        .await
        .expect("no ack reply");
    assert_eq!(reply.mtype, MessageType::Ack);

    tokio::time::sleep(REMOVE_DELAY / 3).await;
    assert!(source.exists(), "source removed before the delay elapsed");
    assert!(
        eventually(|| !source.exists(), REMOVE_DELAY * 4).await,
        "acked source never removed"
    );

    srv.shutdown().await;
}
