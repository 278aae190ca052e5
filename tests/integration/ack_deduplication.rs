// Two servers announce the same file; the client pushes to whichever came
// first and acks the other. With delete on, both sources end up removed.

use std::time::Duration;

use ferry_test_utils::{eventually, write_ini, SLOW_JOINER};
use server::{MoveServer, ServerArgs};

async fn start_server(work: &std::path::Path, name: &str, in_dir: &std::path::Path) -> MoveServer {
    let ini = write_ini(
        work,
        &format!("{name}.ini"),
        &format!(
            "[chain]\n\
             origin = {}/H-{{nominal_time:%Y%m%d%H%M}}-__\n\
             request_address = 127.0.0.1\n\
             request_port = 0\n\
             topic = /H\n\
             delete = true\n\
             remove_delay = 0.2\n\
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
async fn duplicate_announcements_ack_and_clean_both_sources() {
    let work = tempfile::tempdir().unwrap();
    let in_one = tempfile::tempdir().unwrap();
    let in_two = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();

    let srv_one = start_server(work.path(), "one", in_one.path()).await;
    let srv_two = start_server(work.path(), "two", in_two.path()).await;

    let client_ini = write_ini(
        work.path(),
        "client.ini",
        &format!(
            "[chain]\n\
             providers = 127.0.0.1:{} 127.0.0.1:{}\n\
             destination = file://{}\n\
             topic = /H\n\
             heartbeat = off\n",
            srv_one.publish_port(),
            srv_two.publish_port(),
            out_dir.path().display()
        ),
    );
    let mut cli = client::MoveClient::new(client::ClientArgs {
        config_file: client_ini,
    });
    cli.reload().await.unwrap();
    tokio::time::sleep(SLOW_JOINER).await;

    // The same file appears at both providers.
    let source_one = in_one.path().join("H-202401011200-__");
    let source_two = in_two.path().join("H-202401011200-__");
    std::fs::write(&source_one, b"data").unwrap();
    std::fs::write(&source_two, b"data").unwrap();

    // Exactly one transfer happens.
    let delivered = out_dir.path().join("H-202401011200-__");
    assert!(
        eventually(|| delivered.exists(), Duration::from_secs(5)).await,
        "file never delivered"
    );
    assert_eq!(std::fs::read(&delivered).unwrap(), b"data");

    // Push on one side, ack on the other: both sources get cleaned.
    assert!(
        eventually(
            || !source_one.exists() && !source_two.exists(),
            Duration::from_secs(10)
        )
        .await,
        "sources were not cleaned up (one: {}, two: {})",
        source_one.exists(),
        source_two.exists(),
    );

    cli.shutdown().await;
    srv_one.shutdown().await;
    srv_two.shutdown().await;
}
