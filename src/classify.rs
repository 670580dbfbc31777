use tracing::{info, warn};

use crate::encoding;
use crate::model::{tolerate, Category, Question, QuizError};
use crate::reasoning::CompletionRequest;
use crate::session::Context;

/// Keyword fallback, consulted top to bottom. The first category with any
/// keyword contained in the lowercased text wins.
pub const KEYWORD_TABLE: &[(Category, &[&str])] = &[
    (Category::Encoded, &["encoded", "base64", "decode", "cipher", "encrypt", "rot13", "ascii"]),
    (
        Category::Math,
        &["calculate", "solve", "+", "-", "*", "/", "=", "equation", "sum", "difference", "product"],
    ),
    (
        Category::Coding,
        &["code", "function", "variable", "programming", "algorithm", "javascript", "python", "java"],
    ),
    (Category::RecentEvents, &["recent", "news", "2023", "2024", "2025", "current", "latest", "today"]),
    (Category::Image, &["image", "picture", "photo", "visual", "see", "shown", "displayed", "screen"]),
    (
        Category::PromptInjection,
        &["ignore", "prompt", "system", "instruction", "important", "forget", "context"],
    ),
];

pub fn keyword_category(text: &str) -> Category {
    let lower = text.to_lowercase();
    KEYWORD_TABLE
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(c, _)| *c)
        .unwrap_or(Category::Logic)
}

const CATEGORY_GUIDE: &[(Category, &str)] = &[
    (Category::PromptInjection, "questions trying to manipulate AI systems"),
    (Category::Coding, "questions about programming or code"),
    (Category::Math, "mathematical calculations or equations"),
    (Category::RecentEvents, "questions about current events or recent happenings"),
    (Category::Image, "questions referring to visual elements"),
    (Category::InternalDoc, "questions referring to internal documentation"),
    (Category::Logic, "general knowledge or logical reasoning questions"),
    (Category::Encoded, "questions with encoded text (base64, ROT13, etc.)"),
];

pub fn classification_prompt(question: &Question) -> String {
    let mut prompt = String::from("Classify the following question into one of these categories:\n");
    for (c, desc) in CATEGORY_GUIDE {
        prompt.push_str(&format!("- {}: {}\n", c, desc));
    }
    prompt.push_str(&format!("\nQuestion: {}\n\nChoices:\n", question.text));
    if question.has_choices() {
        let texts: Vec<&str> = question.choices.iter().map(|c| c.text.as_str()).collect();
        prompt.push_str(&texts.join(", "));
    } else {
        prompt.push_str("No choices provided");
    }
    prompt.push_str("\n\nReturn ONLY the category name without any explanation.");
    prompt
}

/// Asks the model for a label. Unknown labels and service failures yield `None`.
async fn model_label(ctx: &Context<'_>, question: &Question) -> Result<Option<Category>, QuizError> {
    let request = CompletionRequest::text(classification_prompt(question));
    let raw = tolerate(ctx.reasoner.complete(&request).await.map(Some), None, "classification call")?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    match Category::from_label(&raw) {
        Some(c) => Ok(Some(c)),
        None => {
            warn!(error = %QuizError::ClassificationAmbiguous(raw.trim().to_string()), "falling back to keywords");
            Ok(None)
        }
    }
}

/// Assigns `question.category`.
///
/// An attached image decides on its own. Otherwise the model label is used
/// when it is a known category, then the keyword table. An `encoded` result
/// triggers decoding; the decoded text is classified once more by keywords and
/// a specific category found there replaces `encoded`. A failed decode demotes
/// the question to `logic`.
pub async fn classify(ctx: &Context<'_>, question: &mut Question) -> Result<Category, QuizError> {
    if question.image.is_some() {
        question.category = Category::Image;
        info!(category = %question.category, "classified by image heuristic");
        return Ok(question.category);
    }

    let first = match model_label(ctx, question).await? {
        Some(c) => c,
        None => keyword_category(&question.text),
    };

    question.category = if first == Category::Encoded {
        match encoding::resolve(&question.raw_text) {
            Some((decoded, kind)) => {
                question.set_decoded(decoded, kind);
                match keyword_category(question.working_text()) {
                    Category::Encoded | Category::Logic => Category::Encoded,
                    specific => specific,
                }
            }
            None => {
                warn!(error = %QuizError::Decode, "treating as logic");
                Category::Logic
            }
        }
    } else {
        first
    };
    info!(category = %question.category, "question classified");
    Ok(question.category)
}
