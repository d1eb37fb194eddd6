// Centralized constants for imgkit to avoid magic numbers

/// Operating system recorded in synthesized image configs
pub const DEFAULT_OS: &str = "linux";

/// Filesystem type for the `rootfs` descriptor of an image config
pub const ROOTFS_TYPE_LAYERS: &str = "layers";

/// Name of the manifest entry inside a daemon save/load archive
pub const ARCHIVE_MANIFEST_FILE: &str = "manifest.json";

/// Prefix for the temporary directory holding an exported previous image
pub const PREVIOUS_IMAGE_DIR_PREFIX: &str = "imgkit.local.reuse-layer.";

/// Number of in-flight chunks between the archive producer and the daemon import
pub const ARCHIVE_CHANNEL_CAPACITY: usize = 16;

/// Size of each chunk handed across the archive pipe (256 KB)
pub const ARCHIVE_CHUNK_SIZE: usize = 256 * 1024;

/// Registry used when a reference names none
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Tag used when a reference names neither tag nor digest
pub const DEFAULT_TAG: &str = "latest";

/// Docker schema 2 manifest media type
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// OCI image manifest media type
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Docker image config media type
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Docker gzipped layer media type
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
