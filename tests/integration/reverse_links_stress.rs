#![allow(missing_docs)]

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

use sombra_session::logging::init_logging;
use sombra_session::{
    ClusterId, Entity, LinkBag, LinkMap, LinkSet, MemStorage, Record, RecordId, Result, Session,
    SessionOptions, Storage,
};

const NODE_COUNT: usize = 128;
const ROUNDS: usize = 12;
const OPS_PER_ROUND: usize = 200;
const SEED: u64 = 0x5eed_1ed5;

type Links = BTreeMap<(RecordId, String, RecordId), u32>;

fn link_views(session: &mut Session, clusters: &[ClusterId]) -> Result<(Links, Links)> {
    let mut forward = Links::new();
    let mut reverse = Links::new();
    for &cluster in clusters {
        let records: Vec<Record> = session.browse_cluster(cluster)?.collect::<Result<_>>()?;
        for record in &records {
            let id = record.id();
            let Some(entity) = record.entity() else {
                continue;
            };
            for (name, value) in entity.properties() {
                value.for_each_link(|target| {
                    if target != id {
                        *forward.entry((id, name.to_owned(), target)).or_default() += 1;
                    }
                });
            }
            for (name, bag) in entity.reverse_link_properties() {
                for (source, count) in bag.entries() {
                    *reverse.entry((source, name.to_owned(), id)).or_default() += count;
                }
            }
        }
    }
    Ok((forward, reverse))
}

fn random_edit(session: &mut Session, rng: &mut ChaCha8Rng, live: &[RecordId]) -> Result<()> {
    let src = live[rng.gen_range(0..live.len())];
    let dst = live[rng.gen_range(0..live.len())];
    let key = format!("k{}", rng.gen_range(0..4));
    let choice = rng.gen_range(0..6);
    session.update(src, |record| {
        let entity = record.expect_entity_mut()?;
        match choice {
            0 => {
                entity.set("best", dst)?;
            }
            1 => {
                if entity.contains("tags") {
                    entity.link_set_mut("tags")?.insert(dst);
                } else {
                    entity.set("tags", LinkSet::from_iter([dst]))?;
                }
            }
            2 => {
                if entity.contains("tags") {
                    entity.link_set_mut("tags")?.remove(dst);
                }
            }
            3 => {
                if entity.contains("seen") {
                    entity.link_bag_mut("seen")?.add(dst);
                } else {
                    entity.set("seen", LinkBag::from_iter([dst, dst]))?;
                }
            }
            4 => {
                if entity.contains("roles") {
                    entity.link_map_mut("roles")?.insert(key, dst);
                } else {
                    entity.set("roles", LinkMap::from_iter([(key, dst)]))?;
                }
            }
            _ => {
                entity.remove("seen")?;
            }
        }
        Ok(())
    })
}

#[test]
fn randomized_link_churn_stays_symmetric() -> Result<()> {
    init_logging("sombra_session=warn")?;
    let storage = Arc::new(MemStorage::new());
    let clusters = [storage.add_cluster("left"), storage.add_cluster("right")];
    let mut session = Session::open(SessionOptions::new(storage.clone()))?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);

    let mut live: Vec<RecordId> = Vec::with_capacity(NODE_COUNT);
    session.execute_in_tx(|s| {
        for i in 0..NODE_COUNT {
            let cluster = clusters[i % clusters.len()];
            live.push(s.create(Record::document(Entity::new()).in_cluster(cluster))?);
        }
        Ok(())
    })?;
    for id in live.iter_mut() {
        *id = session.refresh_id(*id);
    }

    for round in 0..ROUNDS {
        session.begin()?;
        for _ in 0..OPS_PER_ROUND {
            if rng.gen_ratio(1, 40) && live.len() > 2 {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                session.delete(victim)?;
            } else if rng.gen_ratio(1, 20) {
                let cluster = clusters[rng.gen_range(0..clusters.len())];
                live.push(session.create(Record::document(Entity::new()).in_cluster(cluster))?);
            } else {
                random_edit(&mut session, &mut rng, &live)?;
            }
        }

        let (forward, reverse) = link_views(&mut session, &clusters)?;
        assert_eq!(forward, reverse, "overlay view diverged in round {round}");

        if round % 4 == 3 {
            session.rollback(false)?;
            // Records deleted by the rolled-back round are back.
            live.clear();
            for &cluster in &clusters {
                for record in session.browse_cluster(cluster)? {
                    live.push(record?.id());
                }
            }
        } else {
            session.commit()?;
            for id in live.iter_mut() {
                *id = session.refresh_id(*id);
            }
        }

        for &cluster in &clusters {
            session.invalidate_cluster(cluster);
        }
        let (forward, reverse) = link_views(&mut session, &clusters)?;
        assert_eq!(forward, reverse, "stored view diverged in round {round}");
        let stored: u64 = clusters
            .iter()
            .map(|c| storage.count_records(*c))
            .sum::<Result<u64>>()?;
        assert_eq!(stored, live.len() as u64);
    }
    Ok(())
}
