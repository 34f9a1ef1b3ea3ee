//! Provider wiring for the server.

pub mod http;

use std::sync::Arc;

use reelforge_core::{ProviderRegistry, RuntimeError, TaskKind};

use crate::config::Config;
use self::http::{HttpAvatarGroups, HttpProvider, HttpRelocator};

/// Build the registry from configured endpoints.
///
/// Fails with a configuration error naming the first missing endpoint.
pub fn registry(cfg: &Config) -> Result<ProviderRegistry, RuntimeError> {
    let relocator = HttpRelocator::new(cfg.endpoint("assets", &cfg.assets)?.clone());
    let groups = HttpAvatarGroups::new(cfg.endpoint("avatar", &cfg.avatar)?.clone());
    let mut registry = ProviderRegistry::new(Arc::new(relocator), Arc::new(groups));

    for (kind, name, slot) in [
        (TaskKind::Image, "image", &cfg.image),
        (TaskKind::Audio, "audio", &cfg.audio),
        (TaskKind::Motion, "motion", &cfg.motion),
        (TaskKind::Video, "video", &cfg.video),
    ] {
        let endpoint = cfg.endpoint(name, slot)?.clone();
        registry = registry.register(kind, Arc::new(HttpProvider::new(name, endpoint)));
    }
    registry.validate()?;
    Ok(registry)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_endpoint_is_a_configuration_error() {
        let cfg = Config::from_lookup(|key| {
            key.starts_with("REELFORGE_")
                .then(|| "x".to_owned())
                .filter(|_| !key.contains("MOTION"))
        });
        let err = registry(&cfg).unwrap_err();
        assert!(err.to_string().contains("motion"));
    }

    #[test]
    fn complete_configuration_builds() {
        let cfg = Config::from_lookup(|key| {
            (key.ends_with("_URL") || key.ends_with("_API_KEY"))
                .then(|| "https://p.example".to_owned())
        });
        assert!(registry(&cfg).is_ok());
    }
}
