pub mod bindings;
pub mod repair;

use dvr_core::DvrConfig;
use dvrgrid_state::BindingStore;

pub fn open_store(config: &DvrConfig) -> anyhow::Result<BindingStore> {
    let path = &config.store.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(BindingStore::open(path)?)
}

pub fn init_config() -> anyhow::Result<()> {
    print!("{}", DvrConfig::default().to_toml_string()?);
    Ok(())
}
