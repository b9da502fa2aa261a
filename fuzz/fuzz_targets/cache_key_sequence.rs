#![no_main]

use std::collections::BTreeMap;

use frankenengine_memo::cache::{CacheError, CacheOutcome, CompositeEphemeronCache};
use frankenengine_memo::heap::{EphemeronHost, GcObjectId, Heap};
use frankenengine_memo::key::{KeyComponent, KeyTuple};
use frankenengine_memo::scope::SiteId;
use frankenengine_memo::value::PrimitiveKey;
use libfuzzer_sys::fuzz_target;

const MAX_STEPS: usize = 128;
const POOL: usize = 4;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    run_key_program(data);
});

fn run_key_program(data: &[u8]) {
    let arity = usize::from(byte(data, 0) % 4);
    let mut heap = Heap::new();
    let Ok(mut cache) = CompositeEphemeronCache::new(&mut heap, SiteId(0), arity) else {
        return;
    };
    let mut pool: Vec<GcObjectId> = (0..POOL).map(|_| pinned(&mut heap)).collect();
    let mut model: BTreeMap<KeyTuple, GcObjectId> = BTreeMap::new();

    let mut cursor = 1usize;
    for _ in 0..MAX_STEPS {
        if cursor >= data.len() {
            break;
        }
        let opcode = byte(data, cursor) % 8;
        cursor = cursor.saturating_add(1);
        match opcode {
            // Reach with a key decoded from the next `arity` bytes.
            0..=4 => {
                let components = (0..arity)
                    .map(|offset| component(byte(data, cursor.saturating_add(offset)), &pool))
                    .collect();
                cursor = cursor.saturating_add(arity);
                let key = KeyTuple::new(components);
                let (instance, outcome) = cache
                    .get_or_insert_with(&mut heap, &key, |host| {
                        Ok::<_, CacheError>(host.new_tuple(0))
                    })
                    .expect("reach with matching arity");
                match model.get(&key) {
                    Some(expected) => {
                        assert_eq!(outcome, CacheOutcome::Hit);
                        assert_eq!(instance, *expected);
                    }
                    None => {
                        assert_eq!(outcome, CacheOutcome::Miss);
                        model.insert(key, instance);
                    }
                }
            }
            // Drop one key object and collect.
            5 | 6 => {
                let index = usize::from(byte(data, cursor)) % POOL;
                cursor = cursor.saturating_add(1);
                let old = pool[index];
                heap.unpin(old).expect("pool objects are pinned");
                pool[index] = pinned(&mut heap);
                heap.collect();
                model.retain(|key, _| !key.weak_objects().contains(&old));
            }
            _ => {
                cache.compact(&mut heap).expect("compact");
            }
        }
    }

    for (key, expected) in &model {
        assert_eq!(cache.lookup(&heap, key).expect("lookup"), Some(*expected));
    }
    assert_eq!(cache.live_entries(&heap).expect("live entries"), model.len());
}

fn component(selector: u8, pool: &[GcObjectId]) -> KeyComponent {
    match selector % 6 {
        0 => KeyComponent::Primitive(PrimitiveKey::Undefined),
        1 => KeyComponent::Primitive(PrimitiveKey::Number(i64::from(selector >> 4))),
        2 => KeyComponent::Primitive(PrimitiveKey::Str(format!("s{}", selector >> 5))),
        _ => KeyComponent::ObjectRef(pool[usize::from(selector >> 3) % pool.len()]),
    }
}

fn pinned(heap: &mut Heap) -> GcObjectId {
    let id = heap.new_tuple(0);
    heap.pin(id).expect("fresh tuple can be pinned");
    id
}

fn byte(data: &[u8], index: usize) -> u8 {
    if data.is_empty() {
        return 0;
    }
    data[index % data.len()]
}
