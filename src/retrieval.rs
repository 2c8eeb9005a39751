//! 知识库检索：向量 + 关键词混合
//!
//! 文档按段落切块入库；检索时向量余弦（有嵌入端点时）与 jieba 分词的
//! Jaccard 关键词两路各自排序，再做 RRF 融合取 top-k。低于相似度阈值的
//! 向量命中不参与融合。空结果是合法输出（优雅降级），不是错误。

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use jieba_rs::Jieba;

use crate::core::AgentError;
use crate::llm::EmbeddingProvider;

/// 检索到的一段参考资料
#[derive(Debug, Clone)]
pub struct Passage {
    pub text: String,
    pub source: String,
    pub score: f32,
}

/// 检索协作方契约：查询进、有序段落出
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Passage>, AgentError>;
}

struct IndexedChunk {
    text: String,
    source: String,
    embedding: Option<Vec<f32>>,
    tokens: HashSet<String>,
}

/// 内存知识库
pub struct VectorKnowledgeBase {
    chunks: Vec<IndexedChunk>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    jieba: Jieba,
    top_k: usize,
    score_threshold: f32,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl VectorKnowledgeBase {
    pub fn new(
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        top_k: usize,
        score_threshold: f32,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            chunks: Vec::new(),
            embedder,
            jieba: Jieba::new(),
            top_k,
            score_threshold,
            chunk_size,
            chunk_overlap,
        }
    }

    /// 读取目录下全部 .txt/.md 文档入库，返回块数
    pub async fn load_dir(&mut self, dir: &Path) -> Result<usize, AgentError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| AgentError::RetrievalFailed(format!("{}: {}", dir.display(), e)))?;
        let mut total = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext != "txt" && ext != "md" {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .map_err(|e| AgentError::RetrievalFailed(format!("{}: {}", path.display(), e)))?;
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            total += self.index_text(&source, &text).await;
        }
        tracing::info!(dir = %dir.display(), chunks = total, "knowledge base loaded");
        Ok(total)
    }

    /// 切块并索引一篇文档，返回产生的块数；嵌入失败的块只留关键词索引
    pub async fn index_text(&mut self, source: &str, text: &str) -> usize {
        let mut count = 0;
        for piece in chunk_text(text, self.chunk_size, self.chunk_overlap) {
            let mut embedding = None;
            if let Some(embedder) = self.embedder.as_ref() {
                match embedder.embed(&piece).await {
                    Ok(v) if !v.is_empty() => embedding = Some(v),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(source, error = %e, "chunk embedding failed, keyword index only")
                    }
                }
            }
            let tokens = self.tokenize(&piece);
            self.chunks.push(IndexedChunk {
                text: piece,
                source: source.to_string(),
                embedding,
                tokens,
            });
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn tokenize(&self, text: &str) -> HashSet<String> {
        self.jieba
            .cut(text, false)
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
            .collect()
    }

    /// 向量路：余弦相似度过阈值后的 (块下标, 分数) 降序序列；
    /// 查询嵌入失败时本路为空，融合退化为关键词单路
    async fn vector_ranking(&self, query: &str) -> Vec<(usize, f32)> {
        let Some(embedder) = self.embedder.as_ref() else {
            return Vec::new();
        };
        let query_emb = match embedder.embed(query).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, keyword leg only");
                return Vec::new();
            }
        };
        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let emb = c.embedding.as_ref()?;
                let score = cosine_similarity(&query_emb, emb);
                (score >= self.score_threshold).then_some((i, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }

    /// 关键词路：jieba 分词 Jaccard 重叠的 (块下标, 分数) 降序序列
    fn keyword_ranking(&self, query: &str) -> Vec<(usize, f32)> {
        let query_tokens = self.tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let score = jaccard_similarity(&query_tokens, &c.tokens);
                (score > 0.0).then_some((i, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

#[async_trait]
impl KnowledgeStore for VectorKnowledgeBase {
    async fn search(&self, query: &str) -> Result<Vec<Passage>, AgentError> {
        if self.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.vector_ranking(query).await;
        let keyword = self.keyword_ranking(query);

        // RRF 融合两路排名
        let rrf_k = 60.0_f32;
        let mut fused: HashMap<usize, f32> = HashMap::new();
        for (rank, (idx, _)) in vector.iter().take(self.top_k * 2).enumerate() {
            *fused.entry(*idx).or_insert(0.0) += 1.0 / (rrf_k + rank as f32);
        }
        for (rank, (idx, _)) in keyword.iter().take(self.top_k * 2).enumerate() {
            *fused.entry(*idx).or_insert(0.0) += 1.0 / (rrf_k + rank as f32);
        }

        let mut results: Vec<(usize, f32)> = fused.into_iter().collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(self.top_k);

        Ok(results
            .into_iter()
            .map(|(idx, score)| Passage {
                text: self.chunks[idx].text.clone(),
                source: self.chunks[idx].source.clone(),
                score,
            })
            .collect())
    }
}

/// 段落优先切块：按空行分段，段落过长再按尺寸滚动切分（带重叠）
fn chunk_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        let chars: Vec<char> = para.chars().collect();
        if chars.len() <= chunk_size {
            pieces.push(para.to_string());
            continue;
        }
        let step = chunk_size.saturating_sub(chunk_overlap).max(1);
        let mut start = 0;
        while start < chars.len() {
            let end = (start + chunk_size).min(chars.len());
            let piece: String = chars[start..end].iter().collect();
            let piece = piece.trim().to_string();
            if !piece.is_empty() {
                pieces.push(piece);
            }
            if end == chars.len() {
                break;
            }
            start += step;
        }
    }
    pieces
}

/// 余弦相似度
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    if intersection == 0 {
        return 0.0;
    }
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}
