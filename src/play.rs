use std::{fmt, sync::Arc};

use rand::Rng;

use crate::{
    catalog::{Catalog, Clip, Collection},
    entity::{ChannelId, GuildId, UserId},
    voice::VoiceStates,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BuildError {
    #[error("user {user} is not in a voice channel of guild {guild}")]
    NoVoiceChannel { guild: GuildId, user: UserId },

    #[error("collection {0} has nothing to pick from")]
    NothingToPick(Arc<str>),
}

/// One clip to play for a requester, plus at most one chained follow-up.
pub struct PlayRequest {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub clip: Arc<Clip>,
    /// Set when the requester named the clip instead of leaving it to chance.
    pub forced: bool,
    pub next: Option<Box<PlayRequest>>,
}

impl fmt::Debug for PlayRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayRequest")
            .field("guild", &self.guild_id)
            .field("channel", &self.channel_id)
            .field("user", &self.user_id)
            .field("clip", &self.clip.key())
            .field("forced", &self.forced)
            .field("next", &self.next)
            .finish()
    }
}

/// Resolves a play into a concrete request.
///
/// The requester's current voice channel decides where the clip is played.
/// A chained collection contributes exactly one extra, randomly picked clip.
pub fn build_play<V, R>(
    catalog: &Catalog,
    voice_states: &V,
    rng: &mut R,
    user_id: &UserId,
    guild_id: &GuildId,
    collection: &Collection,
    explicit: Option<Arc<Clip>>,
) -> Result<PlayRequest, BuildError>
where
    V: VoiceStates + ?Sized,
    R: Rng + ?Sized,
{
    let channel_id = voice_states
        .current_channel(guild_id, user_id)
        .ok_or_else(|| BuildError::NoVoiceChannel {
            guild: guild_id.clone(),
            user: user_id.clone(),
        })?;

    let forced = explicit.is_some();
    let clip = match explicit {
        Some(clip) => clip,
        None => pick(collection, rng)?,
    };

    let next = match catalog.chain_target(collection) {
        Some(target) => Some(Box::new(PlayRequest {
            guild_id: guild_id.clone(),
            channel_id: channel_id.clone(),
            user_id: user_id.clone(),
            clip: pick(target, rng)?,
            forced,
            next: None,
        })),
        None => None,
    };

    Ok(PlayRequest {
        guild_id: guild_id.clone(),
        channel_id,
        user_id: user_id.clone(),
        clip,
        forced,
        next,
    })
}

fn pick<R: Rng + ?Sized>(collection: &Collection, rng: &mut R) -> Result<Arc<Clip>, BuildError> {
    collection
        .pick_weighted(rng)
        .cloned()
        .ok_or_else(|| BuildError::NothingToPick(collection.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalog::CatalogDefinition, voice::VoiceStateCache};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const CATALOG: &str = r#"
        [[collection]]
        id = "jc"
        clips = [{ name = "full", weight = 10 }, { name = "spam", weight = 10 }]

        [[collection]]
        id = "intro"
        chain_with = "jc"
        clips = [{ name = "and", weight = 1 }]
    "#;

    struct Fixture {
        catalog: Catalog,
        states: VoiceStateCache,
        guild: GuildId,
        user: UserId,
        channel: ChannelId,
    }

    fn fixture() -> Fixture {
        let definition = CatalogDefinition::from_toml(CATALOG).unwrap();
        let catalog = Catalog::build(definition, |_| Vec::new()).unwrap();
        let guild = GuildId::new("g").unwrap();
        let user = UserId::new("u").unwrap();
        let channel = ChannelId::new("c").unwrap();
        let states = VoiceStateCache::new();
        states.join(guild.clone(), user.clone(), channel.clone());
        Fixture {
            catalog,
            states,
            guild,
            user,
            channel,
        }
    }

    #[test]
    fn test_random_play_is_not_forced_and_not_chained() {
        let f = fixture();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let jc = f.catalog.get("jc").unwrap();
        for _ in 0..32 {
            let play = build_play(&f.catalog, &f.states, &mut rng, &f.user, &f.guild, jc, None)
                .unwrap();
            assert!(!play.forced);
            assert!(play.next.is_none());
            assert_eq!(play.channel_id, f.channel);
            assert_eq!(play.clip.collection.as_ref(), "jc");
        }
    }

    #[test]
    fn test_explicit_clip_is_forced() {
        let f = fixture();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let jc = f.catalog.get("jc").unwrap();
        let spam = jc.clip("spam").cloned();
        let play =
            build_play(&f.catalog, &f.states, &mut rng, &f.user, &f.guild, jc, spam).unwrap();
        assert!(play.forced);
        assert_eq!(play.clip.name, "spam");
    }

    #[test]
    fn test_chained_collection_adds_exactly_one_hop() {
        let f = fixture();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let intro = f.catalog.get("intro").unwrap();
        for _ in 0..32 {
            let play =
                build_play(&f.catalog, &f.states, &mut rng, &f.user, &f.guild, intro, None)
                    .unwrap();
            let next = play.next.as_ref().expect("chained play");
            assert_eq!(next.guild_id, play.guild_id);
            assert_eq!(next.channel_id, play.channel_id);
            assert_eq!(next.user_id, play.user_id);
            assert_eq!(next.forced, play.forced);
            assert_eq!(next.clip.collection.as_ref(), "jc");
            assert!(next.next.is_none());
        }
    }

    #[test]
    fn test_requester_outside_voice_is_rejected() {
        let f = fixture();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let stranger = UserId::new("stranger").unwrap();
        let err = build_play(
            &f.catalog,
            &f.states,
            &mut rng,
            &stranger,
            &f.guild,
            f.catalog.get("jc").unwrap(),
            None,
        )
        .unwrap_err();
        assert_eq!(
            err,
            BuildError::NoVoiceChannel {
                guild: f.guild.clone(),
                user: stranger
            }
        );
    }
}
