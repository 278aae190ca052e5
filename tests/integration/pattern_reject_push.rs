// Pattern gating over the wire: a push for a name outside the chain's
// origin pattern is refused with an err reply, nothing is transferred, and
// the request port keeps serving.

use std::time::Duration;

use serde_json::json;

use client::PushRequester;
use ferry_protocol::{Message, MessageType};
use ferry_test_utils::write_ini;
use server::{MoveServer, ServerArgs};

#[tokio::test]
async fn push_outside_origin_pattern_is_refused() {
    let work = tempfile::tempdir().unwrap();
    let in_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();

    let ini = write_ini(
        work.path(),
        "server.ini",
        &format!(
            "[chain]\n\
             origin = {}/A-{{num:1d}}.dat\n\
             request_address = 127.0.0.1\n\
             request_port = 0\n\
             topic = /A\n",
            in_dir.path().display()
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
    let port = srv.chain("chain").unwrap().request_port().unwrap();
    let requester = PushRequester::new("127.0.0.1", port);

    // A file with the wrong name exists on disk; the pattern still gates it.
    let intruder = in_dir.path().join("B-1.dat");
    std::fs::write(&intruder, b"data").unwrap();

    let push = Message::new(
        "/A",
        MessageType::Push,
        json!({
            "uid": "B-1.dat",
            "uri": intruder.display().to_string(),
            "destination": format!("file://{}/", out_dir.path().display()),
        }),
    );
    let reply = requester
        .send_and_recv(&push, Duration::from_secs(5))
        .await
        .expect("server did not reply");
    assert_eq!(reply.mtype, MessageType::Err);
    assert!(
        !out_dir.path().join("B-1.dat").exists(),
        "refused push must not transfer anything"
    );

    // The connection stays usable after the refusal.
    let pong = requester
        .send_and_recv(&Message::empty("/A", MessageType::Ping), Duration::from_secs(5))
        .await
        .expect("server went silent after refusal");
    assert_eq!(pong.mtype, MessageType::Pong);

    // And a matching name still goes through.
    let legit = in_dir.path().join("A-1.dat");
    std::fs::write(&legit, b"data").unwrap();
    let push = Message::new(
        "/A",
        MessageType::Push,
        json!({
            "uid": "A-1.dat",
            "uri": legit.display().to_string(),
            "destination": format!("file://{}/", out_dir.path().display()),
        }),
    );
    let reply = requester
        .send_and_recv(&push, Duration::from_secs(5))
        .await
        .expect("server did not reply");
    assert_eq!(reply.mtype, MessageType::File);
    assert_eq!(std::fs::read(out_dir.path().join("A-1.dat")).unwrap(), b"data");

    srv.shutdown().await;
}
