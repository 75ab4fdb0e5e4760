// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Live-match aggregator (§4.J). Grounded in the teacher's
//! `upstream/aggregator_feed.rs` for the "fan out, tolerate individual
//! failure" shape, generalized here from a persistent WS feed to a
//! request/response snapshot built from three parallel upstream calls plus
//! a per-participant enrichment fan-out (`futures_util::future::join_all`,
//! the pattern the wider pack uses for `all_settled`-style concurrent
//! fetches where one failure must not sink the whole batch).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Deserialize;

use crate::auth::AuthCore;
use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::error::UpstreamError;
use crate::model::{Account, Puuid};
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Party,
    Pregame,
    Ingame,
}

#[derive(Debug, Clone)]
pub struct LiveMatchSnapshot {
    pub state: MatchState,
    pub mode_id: String,
    pub participants: Vec<EnrichedParticipant>,
}

#[derive(Debug, Clone)]
pub struct EnrichedParticipant {
    pub puuid: Puuid,
    pub display_name: String,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub tier_name: Option<String>,
    pub rating: Option<u32>,
    pub peak_tier_name: Option<String>,
    pub peak_season_label: Option<String>,
    pub win_rate: Option<f64>,
    pub games_played: Option<u32>,
    pub last_match_ally_score: Option<u32>,
    pub last_match_enemy_score: Option<u32>,
}

pub struct MatchEndpoints {
    pub host: String,
    pub party_url: String,
    pub pregame_url_template: String,
    pub ingame_url_template: String,
    pub name_resolve_url: String,
    pub rank_url_template: String,
    pub match_detail_url_template: String,
}

pub struct MatchAggregator {
    upstream: Arc<UpstreamClient>,
    auth: Arc<AuthCore>,
    catalog: Arc<Catalog>,
    clock: Arc<dyn Clock>,
    endpoints: MatchEndpoints,
}

#[derive(Debug, Deserialize)]
struct ParticipantRef {
    puuid: Puuid,
    agent_id: Option<String>,
    #[serde(default)]
    incognito: bool,
}

#[derive(Debug, Deserialize)]
struct RawMatchState {
    mode_id: String,
    participants: Vec<ParticipantRef>,
}

#[derive(Debug, Deserialize)]
struct SeasonStats {
    season_id: String,
    tier: u32,
    wins: u32,
    games: u32,
}

#[derive(Debug, Deserialize)]
struct PeakEntry {
    tier: u32,
    season_id: String,
}

#[derive(Debug, Deserialize)]
struct RankRaw {
    current_tier: Option<u32>,
    rating: Option<u32>,
    peak: Option<PeakEntry>,
    #[serde(default)]
    seasons: Vec<SeasonStats>,
    last_match_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MatchDetail {
    /// `{puuid -> (ally_score, enemy_score)}`.
    round_scores: HashMap<Puuid, (u32, u32)>,
}

impl MatchAggregator {
    pub fn new(
        upstream: Arc<UpstreamClient>,
        auth: Arc<AuthCore>,
        catalog: Arc<Catalog>,
        clock: Arc<dyn Clock>,
        endpoints: MatchEndpoints,
    ) -> Self {
        Self { upstream, auth, catalog, clock, endpoints }
    }

    pub async fn aggregate_live_match(
        &self,
        account: &Account,
    ) -> Result<Option<LiveMatchSnapshot>, UpstreamError> {
        self.auth.auth_user(account.user_id, Some(&account.puuid)).await?;

        let (party, pregame, ingame) = tokio::join!(
            self.fetch_state(&self.endpoints.party_url, &account.puuid),
            self.fetch_state(&self.pregame_url(&account.puuid), &account.puuid),
            self.fetch_state(&self.ingame_url(&account.puuid), &account.puuid),
        );

        let ingame = log_and_drop_err("ingame", ingame);
        let pregame = log_and_drop_err("pregame", pregame);
        let party = log_and_drop_err("party", party);

        let Some((state, raw)) = ingame
            .map(|r| (MatchState::Ingame, r))
            .or_else(|| pregame.map(|r| (MatchState::Pregame, r)))
            .or_else(|| party.map(|r| (MatchState::Party, r)))
        else {
            return Ok(None);
        };

        let participants = self.enrich_participants(&raw, state).await;
        Ok(Some(LiveMatchSnapshot { state, mode_id: raw.mode_id, participants }))
    }

    async fn fetch_state(&self, url: &str, _puuid: &str) -> Result<Option<RawMatchState>, UpstreamError> {
        let body = self.upstream.get_json(&self.endpoints.host, url).await?;
        if body.is_null() {
            return Ok(None);
        }
        let parsed: RawMatchState =
            serde_json::from_value(body).map_err(|e| UpstreamError::Transport(e.to_string()))?;
        if parsed.participants.is_empty() {
            return Ok(None);
        }
        Ok(Some(parsed))
    }

    fn pregame_url(&self, puuid: &str) -> String {
        self.endpoints.pregame_url_template.replace("{puuid}", puuid)
    }

    fn ingame_url(&self, puuid: &str) -> String {
        self.endpoints.ingame_url_template.replace("{puuid}", puuid)
    }

    async fn enrich_participants(&self, raw: &RawMatchState, _state: MatchState) -> Vec<EnrichedParticipant> {
        let puuids: Vec<Puuid> = raw.participants.iter().map(|p| p.puuid.clone()).collect();
        let tables = self.catalog.snapshot().await;
        let is_competitive = tables.modes.get(&raw.mode_id).map(|m| m.is_competitive).unwrap_or(false);

        let names = self.resolve_names(&puuids).await.unwrap_or_default();

        let ranks: Vec<(Puuid, Option<RankRaw>)> = join_all(puuids.iter().map(|puuid| {
            let puuid = puuid.clone();
            async move {
                let rank = self.fetch_rank(&puuid).await.ok().flatten();
                (puuid, rank)
            }
        }))
        .await;
        let ranks: HashMap<Puuid, Option<RankRaw>> = ranks.into_iter().collect();

        let match_details = if is_competitive {
            self.fetch_shared_match_details(ranks.values().flatten()).await
        } else {
            HashMap::new()
        };

        let current_season_id = tables.seasons.iter().max_by_key(|s| s.starts_at).map(|s| s.id.clone());
        let season_start = |id: &str| tables.seasons.iter().find(|s| s.id == id).map(|s| s.starts_at).unwrap_or(0);

        raw.participants
            .iter()
            .enumerate()
            .map(|(idx, p)| {
                let display_name = names.get(&p.puuid).cloned().unwrap_or_else(|| {
                    if p.incognito {
                        p.agent_id
                            .as_ref()
                            .and_then(|id| tables.agents.get(id))
                            .map(|a| a.canonical_name.clone())
                            .unwrap_or_else(|| format!("Player {}", idx + 1))
                    } else {
                        format!("Player {}", idx + 1)
                    }
                });
                let agent_name = p.agent_id.as_ref().and_then(|id| tables.agents.get(id)).map(|a| a.canonical_name.clone());

                let rank = ranks.get(&p.puuid).and_then(|r| r.as_ref());
                let latest_played = rank
                    .and_then(|r| r.seasons.iter().filter(|s| s.games > 0).max_by_key(|s| season_start(&s.season_id)));
                let stale_season = matches!((latest_played, &current_season_id),
                    (Some(latest), Some(current)) if &latest.season_id != current);
                let tier_name = if stale_season {
                    Some("Unranked this season".to_owned())
                } else {
                    rank.and_then(|r| r.current_tier)
                        .and_then(|t| tables.ranks.get(&t.to_string()))
                        .map(|m| m.canonical_name.clone())
                };
                let peak_tier_name = rank
                    .and_then(|r| r.peak.as_ref())
                    .and_then(|peak| tables.ranks.get(&peak.tier.to_string()))
                    .map(|m| m.canonical_name.clone());
                let peak_season_label = rank
                    .and_then(|r| r.peak.as_ref())
                    .and_then(|peak| tables.seasons.iter().find(|s| s.id == peak.season_id))
                    .map(|s| s.label.clone());
                let (win_rate, games_played) = latest_played
                    .map(|s| (s.wins as f64 / s.games.max(1) as f64, s.games))
                    .unzip();

                let scores = match_details.get(&p.puuid);

                EnrichedParticipant {
                    puuid: p.puuid.clone(),
                    display_name,
                    agent_id: p.agent_id.clone(),
                    agent_name,
                    tier_name,
                    rating: rank.and_then(|r| r.rating),
                    peak_tier_name,
                    peak_season_label,
                    win_rate,
                    games_played,
                    last_match_ally_score: scores.map(|(a, _)| *a),
                    last_match_enemy_score: scores.map(|(_, e)| *e),
                }
            })
            .collect()
    }

    async fn resolve_names(&self, puuids: &[Puuid]) -> Result<HashMap<Puuid, String>, UpstreamError> {
        let body = self
            .upstream
            .put_json(&self.endpoints.host, &self.endpoints.name_resolve_url, &serde_json::json!(puuids))
            .await?;
        serde_json::from_value(body).map_err(|e| UpstreamError::Transport(e.to_string()))
    }

    async fn fetch_rank(&self, puuid: &str) -> Result<Option<RankRaw>, UpstreamError> {
        let url = self.endpoints.rank_url_template.replace("{puuid}", puuid);
        let body = self.upstream.get_json(&self.endpoints.host, &url).await?;
        if body.is_null() {
            return Ok(None);
        }
        serde_json::from_value(body).map(Some).map_err(|e| UpstreamError::Transport(e.to_string()))
    }

    /// Dedupes match ids across participants' most-recent competitive game,
    /// fetches each record at most once, and returns a puuid -> round-score
    /// map extracted from the shared records.
    async fn fetch_shared_match_details<'a>(
        &self,
        ranks: impl Iterator<Item = &'a RankRaw>,
    ) -> HashMap<Puuid, (u32, u32)> {
        let match_ids: HashSet<String> = ranks.filter_map(|r| r.last_match_id.clone()).collect();

        let details = join_all(match_ids.into_iter().map(|match_id| async move {
            let url = self.endpoints.match_detail_url_template.replace("{match_id}", &match_id);
            self.upstream.get_json(&self.endpoints.host, &url).await.ok().and_then(|body| {
                serde_json::from_value::<MatchDetail>(body).ok()
            })
        }))
        .await;

        let mut merged = HashMap::new();
        for detail in details.into_iter().flatten() {
            merged.extend(detail.round_scores);
        }
        merged
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

fn log_and_drop_err(label: &str, result: Result<Option<RawMatchState>, UpstreamError>) -> Option<RawMatchState> {
    match result {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(label, err = %e, "live-match aggregator: call failed, treating as empty");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_prefers_ingame_over_pregame_over_party() {
        let ingame = Some(RawMatchState { mode_id: "competitive".into(), participants: vec![] });
        let pregame = Some(RawMatchState { mode_id: "competitive".into(), participants: vec![] });
        let party = Some(RawMatchState { mode_id: "unrated".into(), participants: vec![] });

        let chosen = ingame
            .map(|r| (MatchState::Ingame, r))
            .or_else(|| pregame.map(|r| (MatchState::Pregame, r)))
            .or_else(|| party.map(|r| (MatchState::Party, r)));
        assert_eq!(chosen.map(|(s, _)| s), Some(MatchState::Ingame));
    }
}
