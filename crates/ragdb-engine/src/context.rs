use ragdb_core::types::SearchHit;

const SEPARATOR: &str = "\n\n";

/// Join the best-scoring hits into a context of at most `max_chars`
/// characters. Chunks are taken whole in score order; the first one that
/// does not fit ends the context. Returns the text and the hits used.
pub fn assemble_context(hits: &[SearchHit], max_chars: usize) -> (String, Vec<SearchHit>) {
    let mut ordered: Vec<&SearchHit> = hits.iter().collect();
    ordered.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk_id.cmp(&b.chunk_id)));

    let mut context = String::new();
    let mut used_chars = 0usize;
    let mut used = Vec::new();
    for hit in ordered {
        let len = hit.content.chars().count();
        let sep = if used.is_empty() { 0 } else { SEPARATOR.len() };
        if used_chars + sep + len > max_chars {
            break;
        }
        if sep > 0 {
            context.push_str(SEPARATOR);
        }
        context.push_str(&hit.content);
        used_chars += sep + len;
        used.push(hit.clone());
    }
    (context, used)
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!("Using the following context, answer the question:\n\nContext: {context}\n\nQuestion: {question}\n\nAnswer:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragdb_core::types::Meta;

    fn hit(id: &str, score: f32, len: usize) -> SearchHit {
        SearchHit { chunk_id: id.into(), score, content: "x".repeat(len), metadata: Meta::new() }
    }

    #[test]
    fn lowest_scores_are_dropped_first() {
        let hits = vec![hit("c", 0.2, 40), hit("a", 0.9, 40), hit("b", 0.5, 40)];
        let (ctx, used) = assemble_context(&hits, 90);
        assert_eq!(used.iter().map(|h| h.chunk_id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(ctx.chars().count(), 82);
    }

    #[test]
    fn oversized_top_chunk_gives_empty_context() {
        let (ctx, used) = assemble_context(&[hit("a", 1.0, 50)], 10);
        assert!(ctx.is_empty());
        assert!(used.is_empty());
    }

    #[test]
    fn prompt_contains_context_and_question() {
        let p = build_prompt("CTX", "why?");
        assert!(p.starts_with("Using the following context"));
        assert!(p.contains("Context: CTX"));
        assert!(p.ends_with("Question: why?\n\nAnswer:"));
    }
}
