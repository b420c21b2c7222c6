use crate::types::Place;

/// Anything scoring below this is treated as "not on the map".
const MIN_SIMILARITY: f64 = 0.7;

/// Picks the single best place for a model label, or None when nothing is
/// within tolerance. The label usually differs from the stored name in
/// casing, accents or surrounding words, so this is approximate on purpose.
pub fn best_match<'a>(places: &'a [Place], label: &str) -> Option<&'a Place> {
    let needle = normalize(label);
    if needle.is_empty() {
        return None;
    }
    let mut best: Option<(&Place, f64)> = None;
    for place in places {
        let score = similarity(&needle, &normalize(&place.name));
        if score < MIN_SIMILARITY {
            continue;
        }
        match best {
            Some((_, top)) if top >= score => {}
            _ => best = Some((place, score)),
        }
    }
    best.map(|(place, _)| place)
}

/// Similarity in [0, 1]. Compares the whole strings, then slides the
/// shorter one across the longer one's tokens so "biblioteca" still scores
/// high against "biblioteca central".
fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut best = string_similarity(a, b);
    let (short, long) = if token_count(a) <= token_count(b) {
        (a, b)
    } else {
        (b, a)
    };
    let long_tokens: Vec<&str> = long.split(' ').collect();
    for window in long_tokens.windows(token_count(short)) {
        let score = string_similarity(short, &window.join(" "));
        if score > best {
            best = score;
        }
    }
    best
}

fn token_count(s: &str) -> usize {
    s.split(' ').count()
}

fn string_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

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
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (prev[j + 1] + 1)
                .min(current[j] + 1)
                .min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Lowercases, folds accents, and collapses punctuation and whitespace runs
/// into single spaces.
fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for c in s.chars().flat_map(char::to_lowercase) {
        let c = fold_accent(c);
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            pending_space = true;
        }
    }
    out
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        _ => c,
    }
}
