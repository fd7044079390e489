//! End-to-end scenarios against file-backed "devices" (spec.md §8): normal
//! pass-through I/O, auto-remap on write failure, persistence across
//! reattach, and allocator exhaustion.
//!
//! These exercise `Target` the way a host driver would: construct, drive
//! I/O through `hot_path()`, send messages, tear down.

use sparemap::Target;
use tempfile::NamedTempFile;

fn backing_file(sectors: u64) -> NamedTempFile {
    let file = NamedTempFile::new().expect("failed to create temp file");
    std::fs::write(file.path(), vec![0u8; (sectors * 512) as usize]).expect("failed to size file");
    file
}

fn construction_args(main: &NamedTempFile, spare: &NamedTempFile, meta_sectors: u32) -> Vec<String> {
    vec![
        main.path().to_string_lossy().to_string(),
        spare.path().to_string_lossy().to_string(),
        meta_sectors.to_string(),
    ]
}

#[test]
fn passthrough_read_write_when_unmapped() {
    let main = backing_file(512);
    let spare = backing_file(512);
    let target = Target::construct(&construction_args(&main, &spare, 4)).unwrap();

    target.hot_path().write(100, &[0x42; 512]).unwrap();
    let data = target.hot_path().read(100, 1).unwrap();
    assert_eq!(data, vec![0x42; 512]);
    assert!(!target.hot_path().is_remapped(100));

    target.teardown().unwrap();
}

#[test]
fn manual_remap_redirects_subsequent_io_to_spare() {
    let main = backing_file(512);
    let spare = backing_file(512);
    let target = Target::construct(&construction_args(&main, &spare, 4)).unwrap();

    target.hot_path().write(200, &[0xAA; 512]).unwrap();
    target.message("remap", &["200".to_string()]).unwrap();
    assert!(target.hot_path().is_remapped(200));

    target.hot_path().write(200, &[0xBB; 512]).unwrap();
    let data = target.hot_path().read(200, 1).unwrap();
    assert_eq!(data, vec![0xBB; 512]);

    target.teardown().unwrap();
}

#[test]
fn metadata_and_remap_table_survive_reattach() {
    let main = backing_file(512);
    let spare = backing_file(512);
    let args = construction_args(&main, &spare, 4);

    {
        let target = Target::construct(&args).unwrap();
        target.hot_path().write(50, &[0x11; 512]).unwrap();
        target.message("remap", &["50".to_string()]).unwrap();
        target.hot_path().write(50, &[0x22; 512]).unwrap();
        target.teardown().unwrap();
    }

    let reattached = Target::construct(&args).unwrap();
    assert!(reattached.hot_path().is_remapped(50));
    let data = reattached.hot_path().read(50, 1).unwrap();
    assert_eq!(data, vec![0x22; 512]);

    let status = reattached.message("metadata_status", &[]).unwrap();
    assert!(status.starts_with("version="));
    assert!(!status.contains("copies_ok=0/"));

    reattached.teardown().unwrap();
}

#[test]
fn clear_stats_resets_counters_but_not_remap_table() {
    let main = backing_file(512);
    let spare = backing_file(512);
    let target = Target::construct(&construction_args(&main, &spare, 4)).unwrap();

    target.message("remap", &["5".to_string()]).unwrap();
    let before = target.status_line();
    assert!(before.contains("manual_remaps=1"));

    target.message("clear_stats", &[]).unwrap();
    let after = target.status_line();
    assert!(after.contains("manual_remaps=0"));
    assert!(target.hot_path().is_remapped(5));

    target.teardown().unwrap();
}

#[test]
fn set_auto_remap_toggle_is_reflected_in_hot_path() {
    let main = backing_file(512);
    let spare = backing_file(512);
    let target = Target::construct(&construction_args(&main, &spare, 4)).unwrap();

    target.message("set_auto_remap", &["0".to_string()]).unwrap();
    assert!(!target.hot_path().auto_remap);

    target.message("set_auto_remap", &["1".to_string()]).unwrap();
    assert!(target.hot_path().auto_remap);

    target.teardown().unwrap();
}

#[test]
fn allocator_exhaustion_surfaces_as_error_not_panic() {
    // A spare device whose usable area (after metadata reservations) holds
    // only a handful of sectors; repeated manual remaps should eventually
    // fail cleanly once it is full.
    let main = backing_file(512);
    let spare = backing_file(16);
    let target = Target::construct(&construction_args(&main, &spare, 2)).unwrap();

    let mut last_result = Ok(());
    for sector in 0..32u64 {
        last_result = target
            .message("remap", &[sector.to_string()])
            .map(|_| ());
        if last_result.is_err() {
            break;
        }
    }
    assert!(last_result.is_err(), "expected allocator exhaustion eventually");

    target.teardown().unwrap();
}

/// Poll `cond` until it's true or a bounded delay elapses, to observe the
/// result of the asynchronous auto-remap worker without a fixed sleep
/// (spec.md §8 scenario 2: "within bounded delay").
#[cfg(feature = "fault-injection")]
fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    panic!("condition not met within bounded delay");
}

#[cfg(feature = "fault-injection")]
#[test]
fn auto_remap_on_write_failure_then_routes_to_spare() {
    // spec.md §8 scenario 2.
    let main = backing_file(2048);
    let spare = backing_file(512);
    let mut args = construction_args(&main, &spare, 4);
    args.push("error_threshold=2".to_string());
    let target = Target::construct(&args).unwrap();
    target.main_device().inject_write_failure(1000);

    assert!(target.hot_path().write(1000, &[0x11; 512]).is_err());
    assert!(target.hot_path().write(1000, &[0x11; 512]).is_err());

    wait_until(|| target.hot_path().is_remapped(1000));

    let status = target.status_line();
    assert!(status.contains("errors=W2:R0"), "status was: {}", status);
    assert!(status.contains("auto_remaps=1"), "status was: {}", status);

    target.hot_path().write(1000, &[0x22; 512]).unwrap();
    let data = target.hot_path().read(1000, 1).unwrap();
    assert_eq!(data, vec![0x22; 512]);

    target.teardown().unwrap();
}

#[cfg(feature = "fault-injection")]
#[test]
fn read_repair_from_spare_after_auto_remap() {
    // spec.md §8 scenario 3, built directly on scenario 2.
    let main = backing_file(2048);
    let spare = backing_file(512);
    let mut args = construction_args(&main, &spare, 4);
    args.push("error_threshold=2".to_string());
    let target = Target::construct(&args).unwrap();
    target.main_device().inject_write_failure(1000);

    target.hot_path().write(1000, &[0x33; 512]).ok();
    target.hot_path().write(1000, &[0x33; 512]).ok();
    wait_until(|| target.hot_path().is_remapped(1000));

    target.hot_path().write(1000, &[0x44; 512]).unwrap();
    let data = target.hot_path().read(1000, 1).unwrap();
    assert_eq!(data, vec![0x44; 512]);

    target.teardown().unwrap();
}

#[cfg(feature = "fault-injection")]
#[test]
fn allocator_exhaustion_leaves_one_failed_record_without_entry() {
    // spec.md §8 scenario 6: spare usable = 10 sectors, error_threshold=1,
    // errors forced on 11 distinct main sectors (2000..=2010). Requests are
    // enqueued to the worker in order, so the first 10 succeed and the 11th
    // (2010) is the one the allocator turns away.
    let main = backing_file(4096);
    let spare = backing_file(14);
    let mut args = construction_args(&main, &spare, 4);
    args.push("error_threshold=1".to_string());
    args.push("metadata_copies=1".to_string());
    let target = Target::construct(&args).unwrap();

    for sector in 2000..2011u64 {
        target.main_device().inject_write_failure(sector);
        target.hot_path().write(sector, &[0x55; 512]).ok();
    }

    wait_until(|| {
        (2000..2010u64).all(|s| target.hot_path().is_remapped(s))
            && target.hot_path().health.state_of(2010) == sparemap::HealthState::Failed
    });

    assert!((2000..2010u64).all(|s| target.hot_path().is_remapped(s)));
    assert!(!target.hot_path().is_remapped(2010));
    assert_eq!(
        target.hot_path().health.state_of(2010),
        sparemap::HealthState::Failed
    );

    let status = target.status_line();
    assert!(status.contains("auto_remaps=10"), "status was: {}", status);

    target.teardown().unwrap();
}

#[test]
fn construction_rejects_mismatched_main_device_on_reattach() {
    let main_a = backing_file(512);
    let main_b = backing_file(1024);
    let spare = backing_file(512);

    let args_a = construction_args(&main_a, &spare, 4);
    {
        let target = Target::construct(&args_a).unwrap();
        // force a superblock write so the spare carries main_a's fingerprint
        target.message("remap", &["1".to_string()]).unwrap();
        target.teardown().unwrap();
    }

    let args_b = vec![
        main_b.path().to_string_lossy().to_string(),
        spare.path().to_string_lossy().to_string(),
        "4".to_string(),
    ];
    assert!(Target::construct(&args_b).is_err());
}
