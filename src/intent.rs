//! Fuzzy classifier for balance questions.
//!
//! A message counts as a balance query when a word fuzzy-matches one of
//! the balance targets within 30% edit distance and a context word (or a
//! question mark) is present. Single-word queries short-circuit. Profile
//! and identity phrasing is excluded outright so those questions reach
//! the AI instead.

/// Words that indicate the user is asking about funds.
const TARGETS: &[&str] = &["balance", "credit", "wallet", "sats"];

/// Words that frame the message as a question about the user's own state.
const CONTEXT: &[&str] = &["my", "check", "show", "what", "how much", "how many"];

/// Phrases that force fall-through to the AI path.
const EXCLUSIONS: &[&str] = &[
    "identity",
    "nip05",
    "profile",
    "name",
    "who am i",
    "about me",
    "information about me",
];

/// Exact single-word queries, matched after trailing punctuation strips.
const ONE_WORD: &[&str] = &["balance", "bal", "sats", "wallet", "credit"];

/// Whether `text` should be answered with the balance instead of the AI.
pub fn is_balance_intent(text: &str) -> bool {
    let lower = text.to_lowercase();
    if EXCLUSIONS.iter().any(|term| lower.contains(term)) {
        return false;
    }
    let bare = lower.trim().trim_end_matches(['?', '!', '.']).trim();
    if ONE_WORD.contains(&bare) {
        return true;
    }
    let has_context =
        lower.contains('?') || CONTEXT.iter().any(|word| lower.contains(word));
    if !has_context {
        return false;
    }
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .any(|word| {
            TARGETS
                .iter()
                .any(|target| levenshtein(word, target) <= target.len() * 3 / 10)
        })
}

/// Classic dynamic-programming edit distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != cb);
            cur[j + 1] = sub.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
