//! Query Router
//!
//! Decides, per query, where the answer comes from:
//!
//! 1. **Local hit**: the service runs on this site and the query came
//!    straight from a client. Answer with our own address.
//! 2. **Table hit**: some known site runs it. Answer with the one closest
//!    to the requester (its piggybacked coordinates, else ours).
//! 3. **Forward**: nobody we know runs it. Ask the upstreams, sending our
//!    coordinates along, and turn the candidate list they piggyback into
//!    an answer.
//!
//! Queries carrying coordinates come from downstream sites. Those get
//! the candidate list back as a piggyback along with the answer, so the
//! asking site can rank it itself.

use crate::codec::{attach_location, attach_table, take_location, take_table, PiggybackError};
use crate::domain::services::{normalize_service, LocalServices, ServiceTable};
use crate::domain::{closest_site, EdgeSite, EdgeSiteSet, Point};
use crate::infrastructure::connection_pool::Protocol;
use crate::infrastructure::metrics::RouterMetrics;
use crate::infrastructure::proxy::ProxyError;
use crate::infrastructure::proxy_pool::ProxyPool;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;

/// Why a query could not be answered.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("query carries no question")]
    NoQuestion,
    #[error("malformed location record: {0}")]
    Location(PiggybackError),
    #[error("{0} is not forwarded upstream")]
    NotForwarded(Name),
    #[error("upstream reply does not match the query")]
    Mismatch,
    #[error("unable to parse table returned from upstream: {0}")]
    TableParse(PiggybackError),
    #[error("unable to attach piggyback: {0}")]
    Encode(PiggybackError),
    #[error("upstream {addr} failed: {source}")]
    Upstream {
        addr: SocketAddr,
        source: ProxyError,
    },
    #[error("no healthy upstream")]
    NoHealthy,
}

impl RouteError {
    /// Response code the client gets for this failure.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Self::NoQuestion | Self::Mismatch => ResponseCode::FormErr,
            Self::NotForwarded(_) => ResponseCode::Refused,
            Self::Location(_)
            | Self::TableParse(_)
            | Self::Encode(_)
            | Self::Upstream { .. }
            | Self::NoHealthy => ResponseCode::ServFail,
        }
    }
}

/// Where a query's answer comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteState {
    LocalHit,
    TableHit(EdgeSiteSet),
    Forward,
}

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// This site
    pub site: EdgeSite,
    /// Only names under this zone are forwarded
    pub zone: Name,
    /// Sub-zones of `zone` that are never forwarded
    pub except: Vec<Name>,
    /// Talk to upstreams over TCP even for UDP clients
    pub force_tcp: bool,
    /// TTL of answers we write
    pub answer_ttl: u32,
}

impl RouterConfig {
    pub fn new(site: EdgeSite) -> Self {
        Self {
            site,
            zone: Name::root(),
            except: Vec::new(),
            force_tcp: false,
            answer_ttl: 30,
        }
    }
}

pub struct Router {
    config: RouterConfig,
    local: Arc<LocalServices>,
    table: Arc<ServiceTable>,
    proxies: Arc<ProxyPool>,
    metrics: Arc<RouterMetrics>,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        local: Arc<LocalServices>,
        table: Arc<ServiceTable>,
        proxies: Arc<ProxyPool>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            config,
            local,
            table,
            proxies,
            metrics,
        }
    }

    pub fn site(&self) -> &EdgeSite {
        &self.config.site
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    /// Answer one query. Failures become error replies; this never fails.
    pub async fn handle(&self, mut query: Message) -> Message {
        self.metrics.record_request();

        match self.route(&mut query).await {
            Ok(reply) => {
                self.metrics.record_answered();
                reply
            }
            Err(e) => {
                self.metrics.record_failed();
                let code = e.response_code();
                match &e {
                    RouteError::NotForwarded(_) => tracing::debug!("{}", e),
                    _ => tracing::warn!("query {} failed: {}", query.id(), e),
                }
                error_reply(&query, code)
            }
        }
    }

    /// Which state a query for `service` goes to.
    ///
    /// With `requester` set the query comes from another site, so the
    /// local shortcut does not apply: this site only competes with the
    /// table's sites on distance.
    pub fn classify(&self, service: &str, requester: Option<&Point>) -> RouteState {
        let runs_here = self.local.contains(service);
        if requester.is_none() && runs_here {
            return RouteState::LocalHit;
        }

        let mut sites = self.table.lookup(service).unwrap_or_default();
        if runs_here {
            sites.add(self.config.site);
        }

        if sites.is_empty() {
            RouteState::Forward
        } else {
            RouteState::TableHit(sites)
        }
    }

    async fn route(&self, query: &mut Message) -> Result<Message, RouteError> {
        let question = query.queries().first().cloned().ok_or(RouteError::NoQuestion)?;
        let requester = take_location(query).map_err(RouteError::Location)?;
        let service = service_name(question.name());

        match self.classify(&service, requester.as_ref()) {
            RouteState::LocalHit => {
                self.metrics.record_local_hit();
                tracing::debug!("{} runs here, answering {}", service, self.config.site.address);
                Ok(self.answer(query, &question, self.config.site.address))
            }
            RouteState::TableHit(sites) => {
                self.metrics.record_table_hit();
                let reference = requester.unwrap_or(self.config.site.location);
                let closest = match sites.closest_to(&reference) {
                    Some(site) => *site,
                    None => return Err(RouteError::NoHealthy),
                };
                tracing::debug!(
                    "{} found in table ({} sites), closest to {} is {}",
                    service,
                    sites.len(),
                    reference,
                    closest
                );

                let mut reply = self.answer(query, &question, closest.address);
                if requester.is_some() {
                    attach_table(&mut reply, question.name().clone(), &sites.to_vec())
                        .map_err(RouteError::Encode)?;
                }
                Ok(reply)
            }
            RouteState::Forward => self.forward(query, &question, requester).await,
        }
    }

    /// Whether a name may be sent upstream.
    pub fn is_forwardable(&self, name: &Name) -> bool {
        if !self.config.zone.zone_of(name) {
            return false;
        }
        if *name == self.config.zone {
            return true;
        }
        !self.config.except.iter().any(|except| except.zone_of(name))
    }

    async fn forward(
        &self,
        query: &Message,
        question: &Query,
        requester: Option<Point>,
    ) -> Result<Message, RouteError> {
        if !self.is_forwardable(question.name()) {
            return Err(RouteError::NotForwarded(question.name().clone()));
        }

        if self.proxies.is_empty() {
            tracing::debug!("no upstream to ask for {}", question.name());
            return self.not_found(query, question, requester);
        }

        self.metrics.record_forward();

        let mut outgoing = query.clone();
        attach_location(&mut outgoing, &self.config.site.location).map_err(RouteError::Encode)?;

        let protocol = if self.config.force_tcp {
            Protocol::Tcp
        } else {
            Protocol::Udp
        };

        let total = self.proxies.len();
        let mut down = 0;
        let mut last_error = None;

        for candidate in self.proxies.list() {
            let proxy = if self.proxies.is_down(&candidate) {
                down += 1;
                if down < total {
                    continue;
                }
                match self.proxies.fallback() {
                    Some(proxy) => proxy,
                    None => break,
                }
            } else {
                candidate
            };

            let mut result = proxy.exchange(&outgoing, protocol).await;
            if matches!(&result, Err(e) if e.is_closed()) {
                tracing::debug!("{} closed the connection, retrying once", proxy.addr());
                result = proxy.exchange(&outgoing, protocol).await;
            }

            match result {
                Ok(reply) => {
                    tracing::debug!("{} answered {}", proxy.addr(), question.name());
                    return self.translate(query, question, requester, reply);
                }
                Err(source) => {
                    tracing::warn!("forwarding {} to {} failed: {}", question.name(), proxy.addr(), source);
                    self.proxies.report_failure(&proxy);
                    last_error = Some(RouteError::Upstream {
                        addr: proxy.addr(),
                        source,
                    });
                }
            }
        }

        Err(last_error.unwrap_or(RouteError::NoHealthy))
    }

    /// Turn an upstream reply into the reply for our own requester.
    fn translate(
        &self,
        query: &Message,
        question: &Query,
        requester: Option<Point>,
        mut reply: Message,
    ) -> Result<Message, RouteError> {
        if !reply_matches(query, question, &reply) {
            return Err(RouteError::Mismatch);
        }

        // A plain answer, nothing piggybacked.
        if reply.additionals().is_empty() {
            if reply.answers().is_empty() {
                return Err(RouteError::TableParse(PiggybackError::MissingTable));
            }
            return Ok(reply);
        }

        let sites: Vec<EdgeSite> = take_table(&mut reply).map_err(RouteError::TableParse)?;
        if sites.is_empty() {
            tracing::debug!("no site runs {}", question.name());
            return self.not_found(query, question, requester);
        }

        let reference = requester.unwrap_or(self.config.site.location);
        let closest = match closest_site(sites.iter(), &reference) {
            Some(site) => *site,
            None => return Err(RouteError::NoHealthy),
        };
        tracing::debug!(
            "upstream offered {} sites for {}, closest is {}",
            sites.len(),
            question.name(),
            closest
        );

        reply.take_answers();
        if let Some(record) = address_record(question, closest.address, self.config.answer_ttl) {
            reply.add_answer(record);
        }
        if requester.is_some() {
            attach_table(&mut reply, question.name().clone(), &sites).map_err(RouteError::Encode)?;
        }
        Ok(reply)
    }

    /// Authoritative reply naming `address`.
    fn answer(&self, query: &Message, question: &Query, address: IpAddr) -> Message {
        let mut reply = reply_to(query, ResponseCode::NoError);
        reply.set_authoritative(true);
        if let Some(record) = address_record(question, address, self.config.answer_ttl) {
            reply.add_answer(record);
        }
        reply
    }

    /// Nobody runs the service. A downstream site still gets an (empty)
    /// candidate list so it can tell this apart from a broken upstream.
    fn not_found(
        &self,
        query: &Message,
        question: &Query,
        requester: Option<Point>,
    ) -> Result<Message, RouteError> {
        let mut reply = reply_to(query, ResponseCode::NXDomain);
        if requester.is_some() {
            attach_table(&mut reply, question.name().clone(), &Vec::<EdgeSite>::new())
                .map_err(RouteError::Encode)?;
        }
        Ok(reply)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("site", &self.config.site)
            .field("zone", &self.config.zone)
            .field("upstreams", &self.proxies.len())
            .finish()
    }
}

/// Service a query name asks for: the name without its trailing dot,
/// lowercased.
pub fn service_name(name: &Name) -> String {
    normalize_service(&name.to_ascii())
}

/// The address record answering `question`, if `address` fits the
/// asked-for family. Other query types get the record of the address's
/// own family.
pub fn address_record(question: &Query, address: IpAddr, ttl: u32) -> Option<Record> {
    let rdata = match (question.query_type(), address) {
        (RecordType::A, IpAddr::V4(ip)) => RData::A(A(ip)),
        (RecordType::AAAA, IpAddr::V6(ip)) => RData::AAAA(AAAA(ip)),
        (RecordType::A, IpAddr::V6(_)) | (RecordType::AAAA, IpAddr::V4(_)) => return None,
        (_, IpAddr::V4(ip)) => RData::A(A(ip)),
        (_, IpAddr::V6(ip)) => RData::AAAA(AAAA(ip)),
    };
    let mut record = Record::from_rdata(question.name().clone(), ttl, rdata);
    record.set_dns_class(question.query_class());
    Some(record)
}

/// Empty reply to `query` with `code`, echoing its question.
fn reply_to(query: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code)
        .add_queries(query.queries().to_vec());
    reply
}

/// Error reply for a failed query.
pub fn error_reply(query: &Message, code: ResponseCode) -> Message {
    reply_to(query, code)
}

fn reply_matches(query: &Message, question: &Query, reply: &Message) -> bool {
    if reply.id() != query.id() || reply.message_type() != MessageType::Response {
        return false;
    }
    match reply.queries().first() {
        Some(q) => q.name() == question.name() && q.query_type() == question.query_type(),
        // Some servers drop the question on errors.
        None => reply.response_code() != ResponseCode::NoError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_location;
    use crate::infrastructure::proxy_pool::ProxyPoolConfig;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    fn site(n: u8, lat: f64, lon: f64) -> EdgeSite {
        EdgeSite::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), Point::new(lat, lon))
    }

    fn query(name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(4242)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        msg
    }

    fn router(config: RouterConfig, local: &[&str], table: ServiceTable) -> Router {
        let metrics = Arc::new(RouterMetrics::new("test"));
        Router::new(
            config,
            Arc::new(LocalServices::new(local.iter().copied())),
            Arc::new(table),
            Arc::new(ProxyPool::new(&[], ProxyPoolConfig::default(), metrics.clone())),
            metrics,
        )
    }

    fn answer_ip(reply: &Message) -> Option<IpAddr> {
        match reply.answers().first()?.data()? {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        }
    }

    #[test]
    fn test_service_name() {
        assert_eq!(service_name(&Name::from_str("echo.").unwrap()), "echo");
        assert_eq!(service_name(&Name::from_str("Echo.Svc.").unwrap()), "echo.svc");
        assert_eq!(service_name(&Name::root()), "");
    }

    #[test]
    fn test_address_record_families() {
        let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let a = Query::query(Name::from_str("echo.").unwrap(), RecordType::A);
        let aaaa = Query::query(Name::from_str("echo.").unwrap(), RecordType::AAAA);
        let any = Query::query(Name::from_str("echo.").unwrap(), RecordType::ANY);

        assert_eq!(address_record(&a, v4, 30).unwrap().record_type(), RecordType::A);
        assert_eq!(address_record(&aaaa, v6, 30).unwrap().record_type(), RecordType::AAAA);
        assert!(address_record(&a, v6, 30).is_none());
        assert!(address_record(&aaaa, v4, 30).is_none());
        assert_eq!(address_record(&any, v6, 30).unwrap().record_type(), RecordType::AAAA);
        assert_eq!(address_record(&a, v4, 30).unwrap().ttl(), 30);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(RouteError::NoQuestion.response_code(), ResponseCode::FormErr);
        assert_eq!(RouteError::Mismatch.response_code(), ResponseCode::FormErr);
        assert_eq!(
            RouteError::NotForwarded(Name::root()).response_code(),
            ResponseCode::Refused
        );
        assert_eq!(RouteError::NoHealthy.response_code(), ResponseCode::ServFail);
        assert_eq!(
            RouteError::TableParse(PiggybackError::MissingTable).response_code(),
            ResponseCode::ServFail
        );
    }

    #[tokio::test]
    async fn test_classify() {
        let me = site(1, 0.0, 0.0);
        let table = ServiceTable::new();
        table.update(site(2, 10.0, 10.0), &["web".to_string()]);
        let router = router(RouterConfig::new(me), &["echo"], table);

        assert_eq!(router.classify("echo", None), RouteState::LocalHit);
        assert!(matches!(router.classify("web", None), RouteState::TableHit(s) if s.len() == 1));
        assert_eq!(router.classify("nope", None), RouteState::Forward);

        // A site asking for a local service gets ranked against us.
        let loc = Point::new(5.0, 5.0);
        match router.classify("echo", Some(&loc)) {
            RouteState::TableHit(sites) => assert!(sites.contains(&me)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_declared_names_match_queries_in_any_case() {
        let me = site(1, 0.0, 0.0);
        let other = site(2, 0.0, 1.0);
        let table = ServiceTable::new();
        table.update(other, &["Checkout.".to_string()]);
        let router = router(RouterConfig::new(me), &["Echo"], table);

        let reply = router.handle(query("Echo.", RecordType::A)).await;
        assert_eq!(answer_ip(&reply), Some(me.address));

        let reply = router.handle(query("CHECKOUT.", RecordType::A)).await;
        assert_eq!(answer_ip(&reply), Some(other.address));
    }

    #[tokio::test]
    async fn test_local_hit() {
        let me = site(1, 0.0, 0.0);
        let router = router(RouterConfig::new(me), &["echo"], ServiceTable::new());

        let reply = router.handle(query("echo.", RecordType::A)).await;
        assert_eq!(reply.id(), 4242);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert!(reply.authoritative());
        assert_eq!(answer_ip(&reply), Some(me.address));
        assert_eq!(router.metrics().snapshot().local_hits, 1);
    }

    #[tokio::test]
    async fn test_table_hit_uses_own_location() {
        let me = site(1, 0.0, 0.0);
        let near = site(2, 0.0, 1.0);
        let far = site(3, 0.0, 40.0);
        let table = ServiceTable::new();
        table.update(near, &["web".to_string()]);
        table.update(far, &["web".to_string()]);
        let router = router(RouterConfig::new(me), &[], table);

        let reply = router.handle(query("web.", RecordType::A)).await;
        assert_eq!(answer_ip(&reply), Some(near.address));
        assert!(reply.additionals().is_empty());
        assert_eq!(router.metrics().snapshot().table_hits, 1);
    }

    #[tokio::test]
    async fn test_table_hit_for_site_uses_its_location() {
        let me = site(1, 0.0, 0.0);
        let near_me = site(2, 0.0, 1.0);
        let near_them = site(3, 0.0, 40.0);
        let table = ServiceTable::new();
        table.update(near_me, &["web".to_string()]);
        table.update(near_them, &["web".to_string()]);
        let router = router(RouterConfig::new(me), &[], table);

        let mut q = query("web.", RecordType::A);
        q.add_additional(encode_location(&Point::new(0.0, 39.0)).unwrap());
        let mut reply = router.handle(q).await;
        assert_eq!(answer_ip(&reply), Some(near_them.address));

        let mut offered: Vec<EdgeSite> = take_table(&mut reply).unwrap();
        offered.sort_by_key(|s| s.address);
        assert_eq!(offered, vec![near_me, near_them]);
    }

    #[tokio::test]
    async fn test_malformed_location_is_servfail() {
        let router = router(RouterConfig::new(site(1, 0.0, 0.0)), &["echo"], ServiceTable::new());

        let mut q = query("echo.", RecordType::A);
        let mut loc = encode_location(&Point::new(1.0, 1.0)).unwrap();
        loc.set_name(Name::from_str("other.site.").unwrap());
        q.add_additional(loc);

        let reply = router.handle(q).await;
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(router.metrics().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_no_question_is_formerr() {
        let router = router(RouterConfig::new(site(1, 0.0, 0.0)), &[], ServiceTable::new());
        let mut q = Message::new();
        q.set_id(7);
        let reply = router.handle(q).await;
        assert_eq!(reply.id(), 7);
        assert_eq!(reply.response_code(), ResponseCode::FormErr);
    }

    #[tokio::test]
    async fn test_family_mismatch_is_nodata() {
        let router = router(RouterConfig::new(site(1, 0.0, 0.0)), &["echo"], ServiceTable::new());
        let reply = router.handle(query("echo.", RecordType::AAAA)).await;
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert!(reply.answers().is_empty());
    }

    #[tokio::test]
    async fn test_miss_without_upstream() {
        let router = router(RouterConfig::new(site(1, 0.0, 0.0)), &[], ServiceTable::new());
        let reply = router.handle(query("nope.", RecordType::A)).await;
        assert_eq!(reply.response_code(), ResponseCode::NXDomain);

        // From another site: an empty candidate list rides along.
        let mut q = query("nope.", RecordType::A);
        q.add_additional(encode_location(&Point::new(1.0, 1.0)).unwrap());
        let mut reply = router.handle(q).await;
        assert_eq!(reply.response_code(), ResponseCode::NXDomain);
        let offered: Vec<EdgeSite> = take_table(&mut reply).unwrap();
        assert!(offered.is_empty());
    }

    #[tokio::test]
    async fn test_zone_matching() {
        let mut config = RouterConfig::new(site(1, 0.0, 0.0));
        config.zone = Name::from_str("svc.").unwrap();
        config.except = vec![Name::from_str("internal.svc.").unwrap()];
        let router = router(config, &[], ServiceTable::new());

        assert!(router.is_forwardable(&Name::from_str("svc.").unwrap()));
        assert!(router.is_forwardable(&Name::from_str("web.svc.").unwrap()));
        assert!(!router.is_forwardable(&Name::from_str("db.internal.svc.").unwrap()));
        assert!(!router.is_forwardable(&Name::from_str("example.com.").unwrap()));

        let reply = router.handle(query("example.com.", RecordType::A)).await;
        assert_eq!(reply.response_code(), ResponseCode::Refused);
    }
}
