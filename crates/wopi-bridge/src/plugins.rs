//! The static table mapping a storage file extension to the adapter that
//! handles it, and the bootstrap logic that builds the adapter instances.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use wopi_adapters::{AppAdapter, MarkdownAdapter};
use wopi_client::WopiClient;

use crate::config::{read_secret_file, BridgeConfig};

/// Extension (without the dot, lowercase) -> adapter tag. The tag matches
/// the `app` field the adapter itself reports via [`AppAdapter::tag`].
const BRIDGE_EXT_PLUGINS: &[(&str, &str)] = &[("md", "md"), ("zmd", "md"), ("mds", "md")];

/// The adapter tag responsible for a given storage file extension, or
/// `None` if the extension is not supported.
pub fn adapter_tag_for_extension(ext: &str) -> Option<&'static str> {
    BRIDGE_EXT_PLUGINS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, tag)| *tag)
}

/// All storage file extensions this process knows how to route, for the
/// informational landing page.
pub fn supported_extensions() -> Vec<&'static str> {
    BRIDGE_EXT_PLUGINS.iter().map(|(ext, _)| *ext).collect()
}

/// Build every adapter this process knows how to construct, skipping (with
/// a warning) any whose mandatory configuration is missing. Fatal only if
/// none could be built.
pub fn build_adapters(config: &BridgeConfig, wopi: Arc<WopiClient>) -> HashMap<String, Arc<dyn AppAdapter>> {
    let mut adapters: HashMap<String, Arc<dyn AppAdapter>> = HashMap::new();

    match build_markdown_adapter(config, wopi) {
        Ok(adapter) => {
            let tag = adapter.tag();
            info!(app = tag, "initialized adapter");
            adapters.insert(tag.to_string(), adapter);
        }
        Err(e) => warn!(app = "markdown", error = %e, "disabled adapter following failed initialization"),
    }

    adapters
}

fn build_markdown_adapter(config: &BridgeConfig, wopi: Arc<WopiClient>) -> Result<Arc<dyn AppAdapter>, String> {
    let app_ext_url = std::env::var("CODIMD_EXT_URL").map_err(|_| "CODIMD_EXT_URL is not set".to_string())?;
    let app_url = std::env::var("CODIMD_URL").unwrap_or_else(|_| app_ext_url.clone());
    let apikey_path = config.apikey_path("codimd");
    let apikey = read_secret_file(&apikey_path).map_err(|e| e.to_string())?;

    let http = reqwest::Client::builder()
        .timeout(config.outbound_timeout)
        .danger_accept_invalid_certs(config.skip_ssl_verify)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| e.to_string())?;

    Ok(Arc::new(MarkdownAdapter::new(wopi, http, app_url, app_ext_url, apikey)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions_map_to_markdown() {
        assert_eq!(adapter_tag_for_extension("md"), Some("md"));
        assert_eq!(adapter_tag_for_extension("zmd"), Some("md"));
        assert_eq!(adapter_tag_for_extension("mds"), Some("md"));
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        assert_eq!(adapter_tag_for_extension("docx"), None);
    }
}
