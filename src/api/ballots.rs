use rocket::{serde::json::Json, Route, State};

use crate::error::Result;
use crate::model::{
    api::{BallotDescription, BallotSpec, BallotSummary, Tally, Vote},
    common::BallotId,
};
use crate::service::BallotService;

pub fn routes() -> Vec<Route> {
    routes![
        ballots,
        create_ballot,
        ballot,
        delete_ballot,
        vote,
        results,
    ]
}

#[get("/ballots")]
async fn ballots(service: &State<BallotService>) -> Result<Json<Vec<BallotSummary>>> {
    let ballots = service.list_ballots().await?;
    Ok(Json(ballots.iter().map(Into::into).collect()))
}

#[post("/ballots?<owner>", data = "<spec>", format = "json")]
async fn create_ballot(
    owner: Option<String>,
    spec: Json<BallotSpec>,
    service: &State<BallotService>,
) -> Result<Json<BallotDescription>> {
    let ballot = service.create_ballot(spec.into_inner(), owner).await?;
    Ok(Json(ballot.into()))
}

#[get("/ballots/<ballot_id>")]
async fn ballot(
    ballot_id: BallotId,
    service: &State<BallotService>,
) -> Result<Json<BallotDescription>> {
    let ballot = service.get_ballot(&ballot_id).await?;
    Ok(Json(ballot.into()))
}

#[delete("/ballots/<ballot_id>")]
async fn delete_ballot(ballot_id: BallotId, service: &State<BallotService>) -> Result<()> {
    service.delete_ballot(&ballot_id).await
}

#[post("/ballots/<ballot_id>/votes", data = "<vote>", format = "json")]
async fn vote(
    ballot_id: BallotId,
    vote: Json<Vote>,
    service: &State<BallotService>,
) -> Result<Json<Vec<Tally>>> {
    let tallies = service.record_vote(&ballot_id, vote.into_inner()).await?;
    Ok(Json(tallies))
}

#[get("/ballots/<ballot_id>/results")]
async fn results(
    ballot_id: BallotId,
    service: &State<BallotService>,
) -> Result<Json<Vec<Tally>>> {
    let tallies = service.get_vote_counts(&ballot_id).await?;
    Ok(Json(tallies))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rocket::{http::Status, local::asynchronous::Client, serde::json::serde_json};

    use crate::model::api::BallotStatus;

    use super::*;

    async fn create(client: &Client, spec: &BallotSpec) -> BallotDescription {
        let response = client
            .post(uri!(create_ballot(Some("owner".to_string()))))
            .json(spec)
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let raw_response = response.into_string().await.unwrap();
        serde_json::from_str(&raw_response).unwrap()
    }

    #[backend_test]
    async fn create_and_fetch_ballot(client: Client) {
        let created = create(&client, &BallotSpec::yes_no()).await;
        assert_eq!(created.ballot.owner_id.as_deref(), Some("owner"));
        assert_eq!(created.status, BallotStatus::Active);

        let response = client.get(uri!(ballot(&created.ballot.id))).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let raw_response = response.into_string().await.unwrap();
        let fetched = serde_json::from_str::<BallotDescription>(&raw_response).unwrap();
        assert_eq!(fetched.ballot, created.ballot);

        let response = client.get(uri!(ballots)).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let raw_response = response.into_string().await.unwrap();
        let summaries = serde_json::from_str::<Vec<BallotSummary>>(&raw_response).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, created.ballot.id);
        assert_eq!(summaries[0].measure, created.ballot.measure);
    }

    #[backend_test]
    async fn invalid_spec_is_rejected(client: Client) {
        let mut spec = BallotSpec::yes_no();
        spec.options.truncate(1);
        let response = client
            .post(uri!(create_ballot(_)))
            .json(&spec)
            .dispatch()
            .await;
        assert_eq!(Status::BadRequest, response.status());
    }

    #[backend_test]
    async fn vote_and_read_results(client: Client) {
        let created = create(&client, &BallotSpec::yes_no()).await;
        let id = &created.ballot.id;
        let yes = created.ballot.options[0].id;

        for _ in 0..2 {
            let response = client
                .post(uri!(vote(id)))
                .json(&Vote::Option(yes))
                .dispatch()
                .await;
            assert_eq!(Status::Ok, response.status());
        }

        let response = client.get(uri!(results(id))).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let raw_response = response.into_string().await.unwrap();
        let tallies = serde_json::from_str::<Vec<Tally>>(&raw_response).unwrap();
        assert_eq!(tallies, vec![Tally::new("Yes", 2), Tally::new("No", 0)]);
    }

    #[backend_test]
    async fn bad_votes_map_to_client_errors(client: Client) {
        let created = create(&client, &BallotSpec::yes_no()).await;
        let id = &created.ballot.id;

        let response = client
            .post(uri!(vote(id)))
            .json(&Vote::Option(u64::MAX))
            .dispatch()
            .await;
        assert_eq!(Status::BadRequest, response.status());

        let response = client
            .post(uri!(vote(id)))
            .json(&Vote::WriteIn("Maybe".to_string()))
            .dispatch()
            .await;
        assert_eq!(Status::BadRequest, response.status());

        let mut closed = BallotSpec::yes_no();
        closed.start_time = Some(Utc::now() - Duration::hours(2));
        closed.end_time = Some(Utc::now() - Duration::hours(1));
        let closed = create(&client, &closed).await;
        let response = client
            .post(uri!(vote(&closed.ballot.id)))
            .json(&Vote::Option(closed.ballot.options[0].id))
            .dispatch()
            .await;
        assert_eq!(Status::BadRequest, response.status());
    }

    #[backend_test]
    async fn missing_ballot_is_not_found(client: Client) {
        let missing = BallotId::generate();

        let response = client.get(uri!(ballot(&missing))).dispatch().await;
        assert_eq!(Status::NotFound, response.status());
        let response = client.get(uri!(results(&missing))).dispatch().await;
        assert_eq!(Status::NotFound, response.status());
        let response = client
            .post(uri!(vote(&missing)))
            .json(&Vote::Option(1))
            .dispatch()
            .await;
        assert_eq!(Status::NotFound, response.status());
        let response = client.delete(uri!(delete_ballot(&missing))).dispatch().await;
        assert_eq!(Status::NotFound, response.status());
    }

    #[backend_test]
    async fn malformed_id_does_not_match(client: Client) {
        let response = client.get("/ballots/not%20an%20id").dispatch().await;
        assert_eq!(Status::UnprocessableEntity, response.status());
    }

    #[backend_test]
    async fn delete_removes_ballot(client: Client, service: BallotService) {
        let created = create(&client, &BallotSpec::yes_no()).await;
        let id = &created.ballot.id;

        let response = client.delete(uri!(delete_ballot(id))).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        assert!(service.list_ballots().await.unwrap().is_empty());
        let response = client.get(uri!(ballot(id))).dispatch().await;
        assert_eq!(Status::NotFound, response.status());
    }
}
