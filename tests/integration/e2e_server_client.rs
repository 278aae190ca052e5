// Happy path over loopback: a file appearing on the server side ends up on
// the client side, byte-identical, with one announcement and one republish.

use std::time::Duration;

use ferry_bus::Subscriber;
use ferry_protocol::MessageType;
use ferry_test_utils::{eventually, recv_timeout, write_ini, SLOW_JOINER};
use server::{MoveServer, ServerArgs};

#[tokio::test]
async fn file_flows_from_server_to_client() {
    let work = tempfile::tempdir().unwrap();
    let in_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();

    // Server: watch in_dir, announce on /H, serve requests.
    let server_ini = write_ini(
        work.path(),
        "server.ini",
        &format!(
            "[hrit]\n\
             origin = {}/H-{{nominal_time:%Y%m%d%H%M}}-__\n\
             request_address = 127.0.0.1\n\
             request_port = 0\n\
             topic = /H\n\
             use_polling = true\n\
             watchdog_timeout = 0.1\n",
            in_dir.path().display()
        ),
    );
    let mut srv = MoveServer::new(ServerArgs {
        config_file: server_ini,
        publish_port: 0,
        disable_backlog: true,
        force_polling: false,
    })
    .await
    .unwrap();
    srv.reload().await.unwrap();
    assert_eq!(srv.chain_names(), vec!["hrit"]);

    // A watcher on the server's own announcements, to count them.
    let server_pub = format!("tcp://127.0.0.1:{}", srv.publish_port());
    let mut announcements = Subscriber::connect(&[server_pub], &["/H".to_owned()])
        .await
        .unwrap();

    // Client: subscribe to the server, fetch to out_dir, republish.
    let client_ini = write_ini(
        work.path(),
        "client.ini",
        &format!(
            "[hrit]\n\
             providers = 127.0.0.1:{}\n\
             destination = file://{}\n\
             topic = /H\n\
             heartbeat = off\n",
            srv.publish_port(),
            out_dir.path().display()
        ),
    );
    let mut cli = client::MoveClient::new(client::ClientArgs {
        config_file: client_ini,
    });
    cli.reload().await.unwrap();
    let client_pub = cli
        .chain("hrit")
        .and_then(|chain| chain.publish_port())
        .expect("client chain publishes");
    let mut republished = Subscriber::connect(
        &[format!("tcp://127.0.0.1:{client_pub}")],
        &["/H".to_owned()],
    )
    .await
    .unwrap();

    tokio::time::sleep(SLOW_JOINER).await;

    // The file appears.
    let source = in_dir.path().join("H-202401011200-__");
    std::fs::write(&source, b"data").unwrap();

    // Announcement goes out with a request address.
    let announced = recv_timeout(&mut announcements, Duration::from_secs(5))
        .await
        .expect("no announcement");
    assert_eq!(announced.mtype, MessageType::File);
    assert_eq!(announced.data["uid"], "H-202401011200-__");
    assert!(announced.data["request_address"].is_string());

    // The transfer lands, byte-identical.
    let delivered = out_dir.path().join("H-202401011200-__");
    assert!(
        eventually(|| delivered.exists(), Duration::from_secs(5)).await,
        "file never delivered"
    );
    assert_eq!(std::fs::read(&delivered).unwrap(), b"data");

    // The client republishes local availability.
    let local = recv_timeout(&mut republished, Duration::from_secs(5))
        .await
        .expect("no republish");
    assert_eq!(local.mtype, MessageType::File);
    assert_eq!(local.data["uid"], "H-202401011200-__");
    assert!(local.data.get("request_address").is_none());
    assert!(local.data.get("origin").is_some());

    cli.shutdown().await;
    srv.shutdown().await;
}
