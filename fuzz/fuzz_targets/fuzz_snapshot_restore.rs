#![no_main]

use libfuzzer_sys::fuzz_target;
use trialtree_core::StepTree;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Arbitrary blobs must never panic the restore path, only error out.
    let Ok(tree) = StepTree::restore_json(text) else {
        return;
    };

    // Whatever was accepted must re-serialize to a blob that restores to the
    // identical session.
    let snapshot = tree.snapshot();
    let again = StepTree::restore(&snapshot).expect("own snapshot must restore");
    assert_eq!(again.snapshot(), snapshot, "round trip changed the snapshot");
    assert_eq!(
        again.current_path_string(),
        tree.current_path_string(),
        "round trip moved the cursor chain"
    );
});
