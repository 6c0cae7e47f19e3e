use chronolite::chunk::{AppendStatus, OpenChunk};
use chronolite::types::Sample;
use chronolite::union;
use proptest::prelude::*;

fn arb_samples() -> impl Strategy<Value = Vec<Sample>> {
    (
        any::<u64>().prop_map(|t| t % 1_000_000),
        prop::collection::vec((0u64..500, -1.0e9f64..1.0e9, 0u32..16), 1..200),
    )
        .prop_map(|(start, steps)| {
            let mut t = start;
            steps
                .into_iter()
                .map(|(dt, value, flag)| {
                    t += dt;
                    Sample::new(9, t, value, flag)
                })
                .collect()
        })
}

proptest! {
    // whatever was appended decodes back identically, in order
    #[test]
    fn chunk_round_trips_appended_prefix(samples in arb_samples()) {
        let mut chunk = OpenChunk::new(vec![0u8; 8 * 1024], &samples[0]);
        let mut accepted = vec![samples[0]];
        for s in &samples[1..] {
            match chunk.append(s) {
                AppendStatus::Appended => accepted.push(*s),
                AppendStatus::Full => break,
                AppendStatus::OutOfOrder => unreachable!("times are monotone"),
            }
        }
        let sealed = chunk.seal();
        prop_assert!(sealed.verify());
        let decoded: Vec<Sample> = sealed.reader().collect();
        prop_assert_eq!(decoded, accepted);
    }

    // sealed chunks always carry monotone times and a truthful header
    #[test]
    fn sealed_chunk_header_is_truthful(samples in arb_samples()) {
        let mut chunk = OpenChunk::new(vec![0u8; 8 * 1024], &samples[0]);
        for s in &samples[1..] {
            if chunk.append(s) == AppendStatus::Full {
                break;
            }
        }
        let sealed = chunk.seal();
        let decoded: Vec<Sample> = sealed.reader().collect();
        let header = sealed.header();
        prop_assert_eq!(decoded.len() as u32, header.count);
        prop_assert!(decoded.windows(2).all(|w| w[0].time <= w[1].time));
        prop_assert_eq!(decoded.first().unwrap().time, header.min_time);
        prop_assert_eq!(decoded.last().unwrap().time, header.max_time);
        for s in &decoded {
            prop_assert!(header.flag_bloom.contains(u64::from(s.flag)));
        }
    }

    // the union merge always yields a time-sorted stream of everything
    #[test]
    fn union_merge_sorts_everything(
        mut page in prop::collection::vec(0u64..1000, 0..50),
        mut memory in prop::collection::vec(0u64..1000, 0..50),
        mut wal in prop::collection::vec(0u64..1000, 0..50),
    ) {
        page.sort_unstable();
        memory.sort_unstable();
        wal.sort_unstable();
        let mk = |times: &[u64]| -> Vec<Sample> {
            times.iter().map(|&t| Sample::new(1, t, t as f64, 0)).collect()
        };
        let (p, m, w) = (mk(&page), mk(&memory), mk(&wal));
        let total = p.len() + m.len() + w.len();
        let merged = union::merge(p, m, w);
        prop_assert_eq!(merged.len(), total);
        prop_assert!(merged.windows(2).all(|a| a[0].time <= a[1].time));
    }
}
