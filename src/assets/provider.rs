//! Tiered asset loading
//!
//! Point cloud first, then mesh, then the built-in placeholder. Each tier
//! checks that its files exist before reading them, and every failure falls
//! through to the next tier. The placeholder cannot fail.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use super::{
    decode_splat_container, parse_obj, AssetError, AssetTier, MeshData, OverlayAsset,
    PartGeometry, SplatCloud,
};
use crate::settings::AssetSettings;

/// Where asset bytes come from
pub trait AssetSource: Send + Sync {
    fn exists(&self, path: &Path) -> impl Future<Output = bool> + Send;
    fn read(&self, path: &Path) -> impl Future<Output = io::Result<Vec<u8>>> + Send;
}

/// Reads assets from the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FileAssetSource;

impl AssetSource for FileAssetSource {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }
}

/// Resolves the active overlay tier
pub struct AssetProvider<S> {
    source: S,
    settings: AssetSettings,
}

impl<S: AssetSource> AssetProvider<S> {
    pub fn new(source: S, settings: AssetSettings) -> Self {
        Self { source, settings }
    }

    fn timeout(&self) -> Duration {
        let secs = self
            .settings
            .load_timeout_secs
            .clamp(0.0, crate::settings::MAX_LOAD_TIMEOUT_SECS);
        Duration::try_from_secs_f32(secs).unwrap_or(Duration::from_secs(20))
    }

    /// Load the best available tier. Never fails.
    pub async fn load_assets(&self) -> OverlayAsset {
        match self.load_point_cloud().await {
            Ok(asset) => return self.activated(asset),
            Err(e) => log::warn!("Point-cloud tier unavailable: {}", e),
        }

        match self.load_mesh().await {
            Ok(asset) => return self.activated(asset),
            Err(e) => log::warn!("Mesh tier unavailable: {}", e),
        }

        self.activated(self.placeholder())
    }

    fn activated(&self, asset: OverlayAsset) -> OverlayAsset {
        log::info!("Overlay asset tier: {}", describe(&asset));
        asset
    }

    async fn require(&self, path: &Path) -> Result<(), AssetError> {
        if self.source.exists(path).await {
            Ok(())
        } else {
            Err(AssetError::NotFound(path.to_path_buf()))
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, AssetError> {
        self.source.read(path).await.map_err(|source| AssetError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn read_cloud(&self, path: &Path) -> Result<SplatCloud, AssetError> {
        let bytes = self.read(path).await?;
        let cloud = decode_splat_container(&bytes).map_err(|source| AssetError::Container {
            path: path.to_path_buf(),
            source,
        })?;
        if cloud.count == 0 {
            return Err(AssetError::Empty(path.to_path_buf()));
        }
        log::debug!("Decoded {} splats from {}", cloud.count, path.display());
        Ok(cloud)
    }

    async fn read_mesh(&self, path: &Path) -> Result<MeshData, AssetError> {
        let bytes = self.read(path).await?;
        parse_obj(&String::from_utf8_lossy(&bytes)).map_err(|source| AssetError::Mesh {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolves only once both parts have decoded, bounded by the timeout
    pub async fn load_point_cloud(&self) -> Result<OverlayAsset, AssetError> {
        let left_path = &self.settings.point_cloud_left;
        let right_path = &self.settings.point_cloud_right;
        self.require(left_path).await?;
        self.require(right_path).await?;

        let timeout = self.timeout();
        let (left, right) = tokio::time::timeout(timeout, async {
            tokio::try_join!(self.read_cloud(left_path), self.read_cloud(right_path))
        })
        .await
        .map_err(|_| AssetError::Timeout(timeout))??;

        let unit_scale = self.settings.point_cloud_scale;
        Ok(OverlayAsset::new(
            PartGeometry::PointCloud {
                cloud: left,
                unit_scale,
            },
            PartGeometry::PointCloud {
                cloud: right,
                unit_scale,
            },
            [1.0; 4],
        ))
    }

    /// Right part is the mirrored left mesh unless a right file is configured
    pub async fn load_mesh(&self) -> Result<OverlayAsset, AssetError> {
        let left_path = &self.settings.mesh_left;
        self.require(left_path).await?;
        if let Some(right_path) = &self.settings.mesh_right {
            self.require(right_path).await?;
        }

        let timeout = self.timeout();
        let (left, right) = tokio::time::timeout(timeout, async {
            let left = self.read_mesh(left_path).await?;
            let right = match &self.settings.mesh_right {
                Some(right_path) => self.read_mesh(right_path).await?,
                None => left.mirrored_x(),
            };
            Ok::<_, AssetError>((left, right))
        })
        .await
        .map_err(|_| AssetError::Timeout(timeout))??;

        log::debug!(
            "Mesh tier: {} / {} triangles",
            left.triangle_count(),
            right.triangle_count()
        );
        Ok(OverlayAsset::new(
            PartGeometry::Mesh(left),
            PartGeometry::Mesh(right),
            self.settings.mesh_color,
        ))
    }

    /// Two translucent box volumes
    pub fn placeholder(&self) -> OverlayAsset {
        let volume = MeshData::box_volume(self.settings.placeholder_size);
        OverlayAsset::new(
            PartGeometry::Primitive(volume.clone()),
            PartGeometry::Primitive(volume),
            self.settings.placeholder_color,
        )
    }
}

/// Short description of a loaded asset for logs
pub fn describe(asset: &OverlayAsset) -> String {
    match asset.tier() {
        AssetTier::PointCloud => {
            let counts: Vec<String> = asset
                .parts()
                .iter()
                .map(|p| match &p.geometry {
                    PartGeometry::PointCloud { cloud, .. } => cloud.count.to_string(),
                    _ => "?".to_string(),
                })
                .collect();
            format!("point-cloud ({} splats)", counts.join(" + "))
        }
        tier => tier.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::Side;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;

    #[derive(Default)]
    struct MemorySource {
        files: HashMap<PathBuf, Vec<u8>>,
        /// Reads of these paths never complete
        stalled: HashSet<PathBuf>,
    }

    impl MemorySource {
        fn with(mut self, path: &Path, bytes: Vec<u8>) -> Self {
            self.files.insert(path.to_path_buf(), bytes);
            self
        }

        fn stall(mut self, path: &Path) -> Self {
            self.stalled.insert(path.to_path_buf());
            self
        }
    }

    impl AssetSource for MemorySource {
        async fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path) || self.stalled.contains(path)
        }

        async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            if self.stalled.contains(path) {
                std::future::pending::<()>().await;
            }
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    const TRIANGLE: &[u8] = b"v 0 0 0\nv 2 0 0\nv 0 1 0\nf 1 2 3\n";

    fn container(count: u32) -> Vec<u8> {
        let mut bytes = b"KSP\x01".to_vec();
        bytes.extend_from_slice(&count.to_le_bytes());
        bytes.extend(std::iter::repeat(0u8).take(count as usize * 44));
        bytes
    }

    #[tokio::test]
    async fn test_point_cloud_tier_wins() {
        let settings = AssetSettings::default();
        let source = MemorySource::default()
            .with(&settings.point_cloud_left, container(2))
            .with(&settings.point_cloud_right, container(3))
            .with(&settings.mesh_left, TRIANGLE.to_vec());
        let provider = AssetProvider::new(source, settings);

        let asset = provider.load_assets().await;
        assert_eq!(asset.tier(), AssetTier::PointCloud);
        assert_eq!(describe(&asset), "point-cloud (2 + 3 splats)");
    }

    #[tokio::test]
    async fn test_unreachable_point_cloud_falls_back_to_mesh() {
        let settings = AssetSettings::default();
        let source = MemorySource::default()
            .with(&settings.point_cloud_left, container(2))
            .with(&settings.mesh_left, TRIANGLE.to_vec());
        let provider = AssetProvider::new(source, settings);

        let mut asset = provider.load_assets().await;
        assert_eq!(asset.tier(), AssetTier::Mesh);
        asset.set_visible(true);
        for side in Side::BOTH {
            assert!(asset.part(side).visible);
        }
        // Right part mirrors the left
        match &asset.part(Side::Right).geometry {
            PartGeometry::Mesh(mesh) => assert_eq!(mesh.positions[1], [-2.0, 0.0, 0.0]),
            other => panic!("unexpected geometry {:?}", other.tier()),
        }
        assert_eq!(asset.part(Side::Left).geometry.scale_factor(), 0.5);
    }

    #[tokio::test]
    async fn test_malformed_container_falls_through() {
        let settings = AssetSettings::default();
        let source = MemorySource::default()
            .with(&settings.point_cloud_left, vec![0, 0, 0, 0, 1])
            .with(&settings.point_cloud_right, container(1))
            .with(&settings.mesh_left, TRIANGLE.to_vec());
        let provider = AssetProvider::new(source, settings);

        assert!(matches!(
            provider.load_point_cloud().await,
            Err(AssetError::Container { .. })
        ));
        assert_eq!(provider.load_assets().await.tier(), AssetTier::Mesh);
    }

    #[tokio::test]
    async fn test_point_cloud_without_records_falls_through() {
        let settings = AssetSettings::default();
        // Zero count and a record short of its color bytes
        let mut degenerate = b"KSP\x01".to_vec();
        degenerate.extend_from_slice(&0u32.to_le_bytes());
        degenerate.extend(std::iter::repeat(0u8).take(40));
        let source = MemorySource::default()
            .with(&settings.point_cloud_left, degenerate.clone())
            .with(&settings.point_cloud_right, degenerate)
            .with(&settings.mesh_left, TRIANGLE.to_vec());
        let provider = AssetProvider::new(source, settings);

        assert!(provider.load_point_cloud().await.is_err());
        let asset = provider.load_assets().await;
        assert_eq!(asset.tier(), AssetTier::Mesh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_does_not_panic() {
        let settings = AssetSettings {
            load_timeout_secs: 1e30,
            ..AssetSettings::default()
        };
        let source = MemorySource::default()
            .with(&settings.point_cloud_left, container(1))
            .stall(&settings.point_cloud_right);
        let provider = AssetProvider::new(source, settings);

        assert!(matches!(
            provider.load_point_cloud().await,
            Err(AssetError::Timeout(timeout)) if timeout == Duration::from_secs(600)
        ));
    }

    #[tokio::test]
    async fn test_nothing_reachable_gives_placeholder() {
        let provider = AssetProvider::new(MemorySource::default(), AssetSettings::default());
        let asset = provider.load_assets().await;
        assert_eq!(asset.tier(), AssetTier::Primitive);
        assert_eq!(asset.parts().len(), 2);
        assert!(asset.parts().iter().all(|p| p.color[3] < 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_point_cloud_times_out() {
        let settings = AssetSettings::default();
        let source = MemorySource::default()
            .with(&settings.point_cloud_left, container(1))
            .stall(&settings.point_cloud_right)
            .with(&settings.mesh_left, TRIANGLE.to_vec());
        let provider = AssetProvider::new(source, settings);

        let started = tokio::time::Instant::now();
        assert!(matches!(
            provider.load_point_cloud().await,
            Err(AssetError::Timeout(_))
        ));
        assert!(started.elapsed() >= Duration::from_secs(20));

        assert_eq!(provider.load_assets().await.tier(), AssetTier::Mesh);
    }
}
