//! Partitioning properties that hold for every shape and group size.

use proptest::prelude::*;
use tessera::{pad_vocab_size, split, split_embedding, HostTensor, ShardConfig};

#[allow(clippy::cast_precision_loss)]
fn iota(shape: &[usize]) -> HostTensor {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|i| i as f32).collect();
    HostTensor::from_f32(shape, &values)
}

proptest! {
    #[test]
    fn prop_shards_concatenate_to_input(
        per_rank in 1usize..5,
        other in 1usize..5,
        world_size in 1usize..5,
        axis in 0usize..2,
    ) {
        let mut shape = [other, other];
        shape[axis] = per_rank * world_size;
        let t = iota(&shape);

        let shards: Vec<HostTensor> = (0..world_size)
            .map(|rank| {
                let cfg = ShardConfig::new(rank, world_size).unwrap();
                split(&t, &cfg, axis).unwrap().into_owned()
            })
            .collect();
        for shard in &shards {
            prop_assert_eq!(shard.shape[axis], per_rank);
        }
        let parts: Vec<&HostTensor> = shards.iter().collect();
        prop_assert_eq!(HostTensor::concat(&parts, axis).unwrap(), t);
    }

    #[test]
    fn prop_single_rank_is_identity(rows in 1usize..6, cols in 1usize..6, axis in 0usize..2) {
        let t = iota(&[rows, cols]);
        let s = split(&t, &ShardConfig::single(), axis).unwrap();
        prop_assert_eq!(&*s, &t);
    }

    #[test]
    fn prop_padded_vocab_is_smallest_multiple(vocab in 1usize..10_000, world_size in 1usize..17) {
        let padded = pad_vocab_size(vocab, world_size);
        prop_assert_eq!(padded % world_size, 0);
        prop_assert!(padded >= vocab);
        prop_assert!(padded - vocab < world_size);
    }

    #[test]
    fn prop_embedding_shards_cover_vocab(vocab in 1usize..40, world_size in 1usize..6) {
        let t = iota(&[vocab, 2]);
        let padded = pad_vocab_size(vocab, world_size);
        let shards: Vec<HostTensor> = (0..world_size)
            .map(|rank| {
                let cfg = ShardConfig::new(rank, world_size).unwrap();
                split_embedding(Some(&t), &cfg, true, 0)
                    .unwrap()
                    .unwrap()
                    .into_owned()
            })
            .collect();
        let parts: Vec<&HostTensor> = shards.iter().collect();
        let joined = HostTensor::concat(&parts, 0).unwrap();
        prop_assert_eq!(joined.shape.clone(), vec![padded, 2]);
        prop_assert_eq!(joined.narrow(0, 0, vocab).unwrap(), t);
        let tail = joined.narrow(0, vocab, padded - vocab).unwrap();
        prop_assert!(tail.to_f32_vec().unwrap().iter().all(|&v| v == 0.0));
    }
}
