use rand::{distributions::Alphanumeric, thread_rng, Rng};

/// Mints the opaque tokens handed out as singer and queue item ids.
pub fn random_string(length: usize) -> String {
    let mut rng = thread_rng();

    std::iter::repeat(())
        .map(|_| rng.sample(Alphanumeric) as char)
        .take(length)
        .collect()
}
