mod test_clustering;
mod test_contrastive;
mod test_metapath;

/// Installs a test logger once; later calls are no-ops.
pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}
