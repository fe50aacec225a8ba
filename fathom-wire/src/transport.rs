use async_trait::async_trait;
use fathom_base::Result;
use futures::stream::BoxStream;

use crate::protocol::*;
use crate::ssi::{ProxyId, Ssi};

/// The collaborator boundary (§1, §6): everything above this trait is
/// core; everything a real implementation does to get bytes onto a wire
/// and back is out of scope here. A production binding implements this
/// trait over whatever RPC transport and codec the cluster speaks; tests
/// in this workspace drive it against [`crate::mock::MockTransport`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn get_value(&self, ssi: &Ssi, req: GetValueRequest) -> Result<GetValueReply>;
    async fn get_key(&self, ssi: &Ssi, req: GetKeyRequest) -> Result<GetKeyReply>;
    async fn get_key_values(&self, ssi: &Ssi, req: GetKeyValuesRequest) -> Result<GetKeyValuesReply>;
    fn get_key_values_stream(
        &self,
        ssi: &Ssi,
        req: GetKeyValuesRequest,
    ) -> BoxStream<'static, Result<GetKeyValuesStreamChunk>>;
    async fn watch_value(&self, ssi: &Ssi, req: WatchValueRequest) -> Result<WatchValueReply>;

    async fn get_read_version(
        &self,
        proxy: ProxyId,
        req: GetReadVersionRequest,
    ) -> Result<GetReadVersionReply>;
    async fn commit(&self, proxy: ProxyId, req: CommitRequest) -> Result<CommitReply>;
    async fn get_key_server_locations(
        &self,
        coordinator: CoordinatorId,
        req: GetKeyServerLocationsRequest,
    ) -> Result<GetKeyServerLocationsReply>;

    async fn split_metrics(&self, ssi: &Ssi, req: SplitMetricsRequest) -> Result<SplitMetricsReply>;
    async fn wait_metrics(&self, ssi: &Ssi, req: WaitMetricsRequest) -> Result<WaitMetricsReply>;
    async fn get_read_hot_ranges(
        &self,
        ssi: &Ssi,
        req: GetReadHotRangesRequest,
    ) -> Result<GetReadHotRangesReply>;
    async fn get_range_split_points(
        &self,
        ssi: &Ssi,
        req: GetRangeSplitPointsRequest,
    ) -> Result<GetRangeSplitPointsReply>;
}
