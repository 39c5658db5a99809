//! OCI and Docker media types the server cares about.

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

pub const OCTET_STREAM: &str = "application/octet-stream";

/// The layer media type matching a manifest's flavor.
pub fn layer_media_type(manifest_media_type: &str) -> Option<&'static str> {
    match manifest_media_type {
        OCI_MANIFEST => Some(OCI_LAYER_GZIP),
        DOCKER_MANIFEST => Some(DOCKER_LAYER_GZIP),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_media_type() {
        assert_eq!(layer_media_type(OCI_MANIFEST), Some(OCI_LAYER_GZIP));
        assert_eq!(layer_media_type(DOCKER_MANIFEST), Some(DOCKER_LAYER_GZIP));
        assert_eq!(layer_media_type("application/vnd.example"), None);
    }
}
