//! One application instance wired over shared in-memory backends.

use std::sync::Arc;

use hotpath::clock::Clock;
use hotpath::config::HotpathConfig;
use hotpath::{
    AdmissionScript, BackgroundPool, DistributedMutex, ExistenceFilter, LogicalExpiryCache,
    OrderMaterializer, OrderStreamPipeline, ShopCacheOrchestrator, ShopRepository,
    TimePartitionedIdGenerator,
};

use crate::{InMemoryBackend, InMemoryOrderStore};

/// Read path, admission and order pipeline of one instance.
///
/// Several nodes built over the same backend and stores behave like a
/// cluster: they share cache, locks, filter, stock counters and the stream.
#[derive(Debug)]
pub struct InMemoryNode {
    /// Cache-aside read path for shops
    pub shops: ShopCacheOrchestrator,
    /// Seckill purchase entry point
    pub admission: AdmissionScript,
    /// Order stream consumers
    pub pipeline: OrderStreamPipeline,
    /// Existence filter shared by the read path
    pub filter: Arc<ExistenceFilter>,
    /// Background pool running rebuilds and registrations
    pub pool: Arc<BackgroundPool>,
}

impl InMemoryNode {
    /// Wires an instance.
    pub fn new(
        backend: &InMemoryBackend,
        shops: Arc<dyn ShopRepository>,
        orders: &InMemoryOrderStore,
        clock: Arc<dyn Clock>,
        config: &HotpathConfig,
    ) -> Self {
        let timeout = config.backend.call_timeout;
        let kv = Arc::new(backend.clone());
        let pool = Arc::new(BackgroundPool::new(
            config.background.workers.into_inner(),
            config.background.queue_capacity,
        ));
        let filter = Arc::new(ExistenceFilter::new(
            kv.clone(),
            Arc::clone(&clock),
            &config.filter,
            timeout,
        ));

        let orchestrator = ShopCacheOrchestrator::new(
            Arc::clone(&filter),
            LogicalExpiryCache::new(kv.clone(), Arc::clone(&clock), timeout),
            DistributedMutex::new(kv.clone(), Arc::clone(&clock), timeout),
            shops,
            Arc::clone(&pool),
            config,
        );

        let ids = Arc::new(TimePartitionedIdGenerator::new(
            kv.clone(),
            Arc::clone(&clock),
            config.ids,
            timeout,
        ));
        let admission = AdmissionScript::new(
            kv.clone(),
            kv.clone(),
            ids,
            config.admission.clone(),
            config.stream.stream_key.clone(),
            timeout,
        );

        let materializer = Arc::new(OrderMaterializer::new(
            Arc::new(orders.clone()),
            clock,
            timeout,
        ));
        let pipeline =
            OrderStreamPipeline::new(kv, materializer, config.stream.clone(), timeout);

        Self {
            shops: orchestrator,
            admission,
            pipeline,
            filter,
            pool,
        }
    }
}
