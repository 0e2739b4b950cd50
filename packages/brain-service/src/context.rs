use crate::model::{Candidate, Citation};

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct FinalizedContext {
	pub candidates: Vec<Candidate>,
	pub rendered: String,
	pub citations: Vec<Citation>,
	pub total_tokens: u32,
}

/// Rough token cost: one token per four characters, at least one for non-empty text.
pub fn estimate_tokens(text: &str) -> u32 {
	let chars = text.chars().count();

	if chars == 0 {
		return 0;
	}

	chars.div_ceil(CHARS_PER_TOKEN) as u32
}

/// Truncates ranked candidates to `top_k`, then drops from the tail until the token estimate fits
/// `max_context_length`, and renders the survivors with citation numbers.
pub fn finalize(
	mut candidates: Vec<Candidate>,
	top_k: u32,
	max_context_length: u32,
) -> FinalizedContext {
	candidates.truncate(top_k as usize);

	let mut costs: Vec<u32> =
		candidates.iter().map(|candidate| estimate_tokens(&candidate.text)).collect();
	let mut total_tokens: u32 = costs.iter().sum();

	while total_tokens > max_context_length {
		let Some(cost) = costs.pop() else {
			break;
		};

		candidates.pop();

		total_tokens -= cost;
	}

	let citations = candidates
		.iter()
		.enumerate()
		.map(|(idx, candidate)| Citation {
			number: idx as u32 + 1,
			note_id: candidate.note_id,
			chunk_index: candidate.chunk_index,
			title: candidate.title.clone(),
		})
		.collect();
	let rendered = render(&candidates);

	FinalizedContext { candidates, rendered, citations, total_tokens }
}

fn render(candidates: &[Candidate]) -> String {
	candidates
		.iter()
		.enumerate()
		.map(|(idx, candidate)| {
			let title = if candidate.title.is_empty() { "Untitled note" } else { &candidate.title };
			let header = if candidate.tags.is_empty() {
				format!("[{}] {title}", idx + 1)
			} else {
				format!("[{}] {title} ({})", idx + 1, candidate.tags.join(", "))
			};

			format!("{header}\n{}", candidate.text.trim())
		})
		.collect::<Vec<_>>()
		.join("\n\n")
}
