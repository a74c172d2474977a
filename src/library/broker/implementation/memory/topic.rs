/// Matches a routing key against a topic binding pattern
///
/// Both are split into dot-separated words. Within the pattern, `*` substitutes exactly one
/// word while `#` substitutes zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();

    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skipped| matches_words(rest, &key[skipped..])),
        Some((word, rest)) => match key.split_first() {
            Some((head, tail)) => (*word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}
