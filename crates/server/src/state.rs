//! Application state and composition root
//!
//! Every component is constructed here once, with its dependencies passed
//! explicitly. There is no runtime container or scanning; the wiring below
//! IS the dependency graph.

use anyhow::Context;
use chatmem_cache::{BoundedQueueCache, BufferCache};
use chatmem_config::Settings;
use chatmem_extraction::{BoundaryDetector, EpisodeExtractor, MemCellExtractor};
use chatmem_llm::{Embedder, HttpEmbedder, LlmBackend, OpenAiBackend};
use chatmem_pipeline::{GroupDispatcher, MemorizePipeline};
use chatmem_retrieval::{AgenticRetriever, HybridRetriever, Retriever};
use chatmem_storage::{
    ConversationMetaStore, GroupProfileStore, QdrantVectorIndex, RecordStore, ScyllaClient,
    ScyllaConversationMetaStore, ScyllaGroupProfileStore, ScyllaRecordStore, TantivyTextIndex,
    TextIndex, TripleStoreWriter, VectorIndex,
};
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub buffer: Arc<dyn BufferCache>,
    pub dispatcher: Arc<GroupDispatcher>,
    pub retriever: Arc<dyn Retriever>,
    pub agentic: Arc<AgenticRetriever>,
    pub records: Arc<dyn RecordStore>,
    pub profiles: Arc<dyn GroupProfileStore>,
    pub meta: Arc<dyn ConversationMetaStore>,
    pub writer: Arc<TripleStoreWriter>,
}

impl AppState {
    /// Connect every backend and wire the component graph
    pub async fn init(settings: Settings) -> anyhow::Result<Self> {
        let settings = Arc::new(settings);

        // External collaborators
        let cache: Arc<dyn BufferCache> = Arc::new(
            BoundedQueueCache::connect(&settings.redis.url, settings.queue.clone())
                .await
                .context("connecting to Redis buffer cache")?,
        );

        let scylla = ScyllaClient::connect(settings.storage.clone())
            .await
            .context("connecting to ScyllaDB")?;
        scylla
            .ensure_schema()
            .await
            .context("ensuring ScyllaDB schema")?;

        let embedder: Arc<dyn Embedder> = Arc::new(
            HttpEmbedder::new(settings.embedding.clone()).context("building embedding client")?,
        );

        let vectors_impl = QdrantVectorIndex::connect(
            settings.vector_index.clone(),
            settings.embedding.dim,
        )
        .await
        .context("connecting to Qdrant")?;
        vectors_impl
            .ensure_collection()
            .await
            .context("ensuring Qdrant collection")?;
        let vectors: Arc<dyn VectorIndex> = Arc::new(vectors_impl);

        let text: Arc<dyn TextIndex> = Arc::new(match &settings.text_index.path {
            Some(path) => TantivyTextIndex::open(path).context("opening text index")?,
            None => {
                tracing::warn!("no text index path configured, using an in-memory index");
                TantivyTextIndex::in_ram().context("creating in-memory text index")?
            }
        });

        let llm: Arc<dyn LlmBackend> =
            Arc::new(OpenAiBackend::new(settings.llm.clone()).context("building LLM backend")?);

        // Stores
        let records: Arc<dyn RecordStore> = Arc::new(ScyllaRecordStore::new(scylla.clone()));
        let profiles: Arc<dyn GroupProfileStore> =
            Arc::new(ScyllaGroupProfileStore::new(scylla.clone()));
        let meta: Arc<dyn ConversationMetaStore> =
            Arc::new(ScyllaConversationMetaStore::new(scylla));

        // Write path
        let writer = Arc::new(TripleStoreWriter::new(
            records.clone(),
            text.clone(),
            vectors.clone(),
            embedder.clone(),
        ));

        let pipeline = Arc::new(MemorizePipeline::new(
            cache.clone(),
            BoundaryDetector::new(llm.clone(), settings.boundary.clone()),
            MemCellExtractor::new(llm.clone()),
            EpisodeExtractor::new(llm.clone()),
            writer.clone(),
            settings.episode.batch_size,
        ));

        let dispatcher = Arc::new(GroupDispatcher::new(
            settings.dispatcher.clone(),
            pipeline,
        ));
        dispatcher.start();

        // Read path
        let hybrid = Arc::new(HybridRetriever::new(
            text,
            vectors,
            embedder,
            settings.retrieval.clone(),
        ));
        let retriever: Arc<dyn Retriever> = hybrid;
        let agentic = Arc::new(AgenticRetriever::new(
            retriever.clone(),
            llm,
            settings.agentic.clone(),
        ));

        tracing::info!("application state initialized");
        Ok(Self {
            settings,
            buffer: cache,
            dispatcher,
            retriever,
            agentic,
            records,
            profiles,
            meta,
            writer,
        })
    }
}
