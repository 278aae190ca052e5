// The dispatcher predicate table, driven through destination resolution and
// an actual local dispatch.

use serde_json::json;

use dispatcher::{get_destinations, handle_message, parse_config};
use ferry_movers::MoverRegistry;
use ferry_protocol::{Message, MessageType};

const CONFIG: &str = r#"
target1:
  host: file://
  filepattern: '{platform_name}_{product}.{format}'
  directory: /input_data/{sensor}
  dispatch_configs:
    - topics:
        - /level2/viirs
        - /level2/avhrr
      conditions:
        - product: [green_snow, true_color]
          sensor: viirs
        - product: [green_snow, overview]
          sensor: avhrr
          except:
            platform_name: NOAA-15
    - topics:
        - /level3/cloudtype
      directory: /input/cloud_products
      conditions:
        - area: omerc_bb
          daylight: '<30'
          coverage: '>50'
"#;

fn level2_message(data: serde_json::Value) -> Message {
    Message::new("/level2/avhrr", MessageType::File, data)
}

#[test]
fn excepted_platform_must_not_match() {
    let root = parse_config(CONFIG).unwrap();
    let msg = level2_message(json!({
        "uri": "/data/pass.png",
        "sensor": "avhrr",
        "product": "green_snow",
        "platform_name": "NOAA-15",
        "format": "png",
    }));
    assert!(
        get_destinations(&root, &msg).is_empty(),
        "NOAA-15 green_snow is excepted and must not dispatch"
    );
}

#[test]
fn allowed_platform_must_match() {
    let root = parse_config(CONFIG).unwrap();
    let msg = level2_message(json!({
        "uri": "/data/pass.png",
        "sensor": "avhrr",
        "product": "overview",
        "platform_name": "NOAA-18",
        "format": "png",
    }));
    let destinations = get_destinations(&root, &msg);
    assert_eq!(destinations.len(), 1);
    assert!(destinations[0]
        .url
        .ends_with("/input_data/avhrr/NOAA-18_overview.png"));
}

#[test]
fn viirs_set_matches_independently() {
    let root = parse_config(CONFIG).unwrap();
    let msg = Message::new(
        "/level2/viirs",
        MessageType::File,
        json!({
            "uri": "/data/pass.png",
            "sensor": "viirs",
            "product": "true_color",
            "platform_name": "NOAA-20",
            "format": "png",
        }),
    );
    assert_eq!(get_destinations(&root, &msg).len(), 1);

    // Wrong sensor fails both sets.
    let msg = level2_message(json!({
        "uri": "/data/pass.png",
        "sensor": "modis",
        "product": "true_color",
        "platform_name": "Aqua",
        "format": "png",
    }));
    assert!(get_destinations(&root, &msg).is_empty());
}

#[test]
fn numeric_orderings_gate_the_cloudtype_item() {
    let root = parse_config(CONFIG).unwrap();
    let base = json!({
        "uri": "/data/ct.nc",
        "sensor": "avhrr",
        "platform_name": "NOAA-18",
        "product": "cloudtype",
        "format": "nc",
        "area": "omerc_bb",
    });

    let mut sunny = base.clone();
    sunny["daylight"] = json!(20.0);
    sunny["coverage"] = json!(75.0);
    let msg = Message::new("/level3/cloudtype", MessageType::File, sunny);
    let destinations = get_destinations(&root, &msg);
    assert_eq!(destinations.len(), 1);
    assert!(destinations[0].url.contains("/input/cloud_products/"));

    let mut too_bright = base;
    too_bright["daylight"] = json!(45.0);
    too_bright["coverage"] = json!(75.0);
    let msg = Message::new("/level3/cloudtype", MessageType::File, too_bright);
    assert!(get_destinations(&root, &msg).is_empty());

    // A message missing the gated key fails the whole set.
    let msg = Message::new(
        "/level3/cloudtype",
        MessageType::File,
        json!({"uri": "/data/ct.nc", "area": "omerc_bb", "coverage": 75.0}),
    );
    assert!(get_destinations(&root, &msg).is_empty());
}

#[tokio::test]
async fn matching_message_dispatches_the_local_file() {
    let source_dir = tempfile::tempdir().unwrap();
    let dest_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("pass.png");
    std::fs::write(&source, b"img").unwrap();

    // Same predicate table, destination rooted in a tempdir.
    let config = CONFIG.replace("/input_data/{sensor}", &format!("{}/{{sensor}}", dest_dir.path().display()));
    let root = parse_config(&config).unwrap();

    let msg = level2_message(json!({
        "uri": source.display().to_string(),
        "sensor": "avhrr",
        "product": "overview",
        "platform_name": "NOAA-18",
        "format": "png",
    }));
    handle_message(&root, &MoverRegistry::standard(), &None, &msg).await;

    let delivered = dest_dir.path().join("avhrr/NOAA-18_overview.png");
    assert!(delivered.exists(), "matched file was not dispatched");
    assert_eq!(std::fs::read(&delivered).unwrap(), b"img");

    // The excepted platform leaves no trace.
    let msg = level2_message(json!({
        "uri": source.display().to_string(),
        "sensor": "avhrr",
        "product": "green_snow",
        "platform_name": "NOAA-15",
        "format": "png",
    }));
    handle_message(&root, &MoverRegistry::standard(), &None, &msg).await;
    assert!(!dest_dir.path().join("avhrr/NOAA-15_green_snow.png").exists());
}
