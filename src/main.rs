use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rig_loop_closing::config::LoopClosingConfig;
use rig_loop_closing::local_mapping::IdleMapping;
use rig_loop_closing::loop_closing;
use rig_loop_closing::simulation::{pose_error, revisit_scene};
use rig_loop_closing::system::SharedState;
use rig_loop_closing::tracking::frame::RigProjection;
use rig_loop_closing::tracking::RelocalizationSignal;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rig_loop_closing=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => LoopClosingConfig::from_yaml_file(&path)?,
        None => LoopClosingConfig::default(),
    };

    let mut scene = revisit_scene();
    println!(
        "Synthetic revisit: {} early, {} away, {} revisit keyframes",
        scene.early.len(),
        scene.away.len(),
        scene.revisit.len()
    );

    let drift_before: Vec<(f64, f64)> = scene
        .revisit
        .iter()
        .filter_map(|id| Some(pose_error(&scene.map.get_keyframe(*id)?.pose, scene.true_poses.get(id)?)))
        .collect();

    let signal = Arc::new(RelocalizationSignal::new());
    let map = std::mem::take(&mut scene.map);
    let shared = SharedState::new(map, Arc::new(IdleMapping::new()), signal.clone());
    let rig: Arc<dyn RigProjection> = scene.rig.clone();

    let handle = loop_closing::spawn(Arc::clone(&shared), rig, &config)?;
    let keyframes = shared.map.read().all_keyframes();
    for kf_id in keyframes {
        handle.insert_keyframe(kf_id)?;
    }
    handle
        .wait_until_idle(Duration::from_secs(120))
        .context("Loop closer did not drain the keyframe queue")?;
    let stats = handle.join()?;

    info!(
        "processed {} keyframes: {} detections, {} verified, {} corrected",
        stats.keyframes_processed, stats.detections, stats.loops_verified, stats.loops_corrected
    );
    if let Some((current, matched)) = stats.last_loop {
        println!("Loop closed: {} -> {}", current, matched);
    } else {
        println!("No loop closed");
    }
    println!("Tracker relocalization requests: {}", signal.times_raised());

    let map = shared.map.read();
    println!("{:>6} {:>14} {:>14}", "KF", "drift before", "drift after");
    for (id, (before, _)) in scene.revisit.iter().zip(&drift_before) {
        let Some(kf) = map.get_keyframe(*id) else {
            continue;
        };
        let Some(truth) = scene.true_poses.get(id) else {
            continue;
        };
        let (after, _) = pose_error(&kf.pose, truth);
        println!("{:>6} {:>12.4} m {:>12.4} m", id.to_string(), before, after);
    }

    Ok(())
}
